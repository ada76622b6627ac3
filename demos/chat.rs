//! Multi-turn chat with KV carry-over on the software device.
//!
//! Run with: cargo run --example chat

use std::path::PathBuf;

use axllm_rs::device::sim::{write_embed_table, SimBackend, SimSpec};
use axllm_rs::{ChatSession, LlmAttr, LlmEngine, PostConfig, SimTokenizer};

fn main() -> anyhow::Result<()> {
    axllm_rs::utils::init_logging("info");

    let spec = SimSpec::small();
    let embed_path = std::env::temp_dir().join("axllm-demo-embeds.bin");
    write_embed_table(&embed_path, spec.vocab, spec.embed_size)?;
    let attr = LlmAttr {
        template_filename_axmodel: PathBuf::from("sim_l%d.axmodel"),
        filename_post_axmodel: PathBuf::from("sim_post.axmodel"),
        filename_tokens_embed: embed_path,
        url_tokenizer: String::new(),
        model_type: "sim".into(),
        tokenizer_type: None,
        axmodel_num: spec.axmodel_num,
        tokens_embed_num: spec.vocab,
        tokens_embed_size: spec.embed_size,
        use_mmap_load_embed: false,
        vpm_model: None,
        vpm_len: 0,
    };

    let backend = SimBackend::new(spec.clone());
    let engine = LlmEngine::load(attr, PostConfig::default(), &backend, 42)?;
    let tokenizer = Box::new(SimTokenizer::new(spec.vocab as u32));
    let mut session = ChatSession::new(engine, tokenizer, "you are helpful")?;

    for msg in ["hi", "tell me more"] {
        println!("> {msg}");
        match session.send(msg, None) {
            Ok(out) => println!(
                "{}\n({} cached positions, {} tokens left this turn)",
                out.text,
                session.context_len(),
                session.remaining_budget()
            ),
            Err(e) if e.is_capacity() => {
                println!("(context full: {e})");
                session.clear_context()?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
