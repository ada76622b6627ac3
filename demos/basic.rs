//! One-shot generation against the software device.
//!
//! Run with: cargo run --example basic

use std::io::{self, Write};
use std::path::PathBuf;

use axllm_rs::device::sim::{write_embed_table, SimBackend, SimSpec};
use axllm_rs::{ChatSession, LlmAttr, LlmEngine, PostConfig, SimTokenizer, StreamChunk};

fn sim_attr(spec: &SimSpec, embed_path: PathBuf) -> LlmAttr {
    LlmAttr {
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
    }
}

fn main() -> anyhow::Result<()> {
    axllm_rs::utils::init_logging("info");

    let spec = SimSpec::small();
    let embed_path = std::env::temp_dir().join("axllm-demo-embeds.bin");
    write_embed_table(&embed_path, spec.vocab, spec.embed_size)?;

    let backend = SimBackend::new(spec.clone());
    let engine = LlmEngine::load(sim_attr(&spec, embed_path), PostConfig::default(), &backend, 42)?;
    let tokenizer = Box::new(SimTokenizer::new(spec.vocab as u32));
    let mut session = ChatSession::new(engine, tokenizer, "")?;

    let mut cb = |chunk: StreamChunk<'_>| {
        print!("{}", chunk.text);
        let _ = io::stdout().flush();
    };
    let out = session.send("hello there", Some(&mut cb))?;
    println!();
    println!(
        "{} tokens, ttft {:.1} ms, {:.1} tokens/s",
        out.token_ids.len(),
        out.ttft_ms,
        out.tokens_per_sec
    );
    Ok(())
}
