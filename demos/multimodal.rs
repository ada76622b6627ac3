//! Single-shot image question answering on the software device.
//!
//! Run with: cargo run --example multimodal

use std::path::PathBuf;

use axllm_rs::device::sim::{write_embed_table, SimBackend, SimSpec};
use axllm_rs::{LlmAttr, PostConfig, SimTokenizer, VlmEngine, VlmSession};

fn main() -> anyhow::Result<()> {
    axllm_rs::utils::init_logging("info");

    let spec = SimSpec {
        vlm_prefill_mask: true,
        ..SimSpec::small()
    };
    let embed_path = std::env::temp_dir().join("axllm-demo-vl-embeds.bin");
    write_embed_table(&embed_path, spec.vocab, spec.embed_size)?;
    let attr = LlmAttr {
        template_filename_axmodel: PathBuf::from("vlm_l%d.axmodel"),
        filename_post_axmodel: PathBuf::from("vlm_post.axmodel"),
        filename_tokens_embed: embed_path,
        url_tokenizer: String::new(),
        model_type: "sim-vl".into(),
        tokenizer_type: None,
        axmodel_num: spec.axmodel_num,
        tokens_embed_num: spec.vocab,
        tokens_embed_size: spec.embed_size,
        use_mmap_load_embed: false,
        vpm_model: Some(PathBuf::from("vlm_vpm.axmodel")),
        vpm_len: spec.vpm_len,
    };

    let backend = SimBackend::new(spec.clone());
    let engine = VlmEngine::load(attr, PostConfig::default(), &backend, 42)?;
    let tokenizer = Box::new(SimTokenizer::with_image_support(
        spec.vocab as u32,
        spec.vpm_len,
    ));
    let mut session = VlmSession::new(engine, tokenizer, "");

    // A synthetic frame of the encoder's native geometry.
    let (w, h) = (
        session.engine().image_width(),
        session.engine().image_height(),
    );
    let frame = vec![128u8; w * h * 3];
    session.set_image(&frame, w, h)?;

    let out = session.send("describe the image", None)?;
    println!("{}", out.text);

    session.clear_image();
    let out = session.send("now a text-only question", None)?;
    println!("{}", out.text);
    Ok(())
}
