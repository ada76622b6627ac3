use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use axllm_rs::device::sim::{write_embed_table, SimBackend, SimSpec};
use axllm_rs::utils;
use axllm_rs::utils::mud::MudFile;
use axllm_rs::{
    ChatSession, HttpTokenizer, LlmAttr, LlmEngine, PostConfig, SimTokenizer, StreamChunk,
    Tokenizer,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat against a partitioned NPU model on the software device", long_about = None)]
struct Args {
    /// Model description (MUD) file; omitted runs a built-in simulated model
    #[arg(long = "m")]
    model: Option<PathBuf>,

    /// Tokenizer service URL; omitted uses the deterministic built-in codec
    #[arg(long)]
    tokenizer_url: Option<String>,

    #[arg(long, default_value = "")]
    system_prompt: String,

    /// One-shot prompts separated by '|'; omitted starts an interactive loop
    #[arg(long, value_delimiter = '|')]
    prompts: Option<Vec<String>>,

    /// Sampling seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_session(args: &Args) -> anyhow::Result<ChatSession> {
    let (attr, post_cfg, spec) = match &args.model {
        Some(path) => {
            let mud = MudFile::parse(path)
                .with_context(|| format!("reading model description {}", path.display()))?;
            let attr = LlmAttr::from_mud(&mud)?;
            let post_cfg = PostConfig::from_mud(&mud)?;
            let spec = SimSpec {
                axmodel_num: attr.axmodel_num,
                vocab: attr.tokens_embed_num,
                embed_size: attr.tokens_embed_size,
                ..SimSpec::small()
            };
            (attr, post_cfg, spec)
        }
        None => {
            // Fully simulated setup: a small geometry with a generated
            // embedding table.
            let spec = SimSpec::small();
            let embed_path = std::env::temp_dir().join("axllm-sim-embeds.bin");
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
            (attr, PostConfig::default(), spec)
        }
    };

    let tokenizer: Box<dyn Tokenizer> = match args.tokenizer_url.as_deref() {
        Some(url) => {
            let kind = attr.tokenizer_type.clone().unwrap_or_else(|| "auto".into());
            Box::new(HttpTokenizer::connect(url, &kind)?)
        }
        None => Box::new(SimTokenizer::new(attr.tokens_embed_num as u32)),
    };

    let backend = SimBackend::new(spec);
    let engine = LlmEngine::load(attr, post_cfg, &backend, args.seed)?;
    Ok(ChatSession::new(engine, tokenizer, &args.system_prompt)?)
}

fn chat_once(session: &mut ChatSession, msg: &str) -> anyhow::Result<()> {
    let mut cb = |chunk: StreamChunk<'_>| {
        print!("{}", chunk.text);
        let _ = io::stdout().flush();
    };
    match session.send(msg, Some(&mut cb)) {
        Ok(out) => {
            println!();
            tracing::info!(
                tokens = out.token_ids.len(),
                tokens_per_sec = out.tokens_per_sec,
                ttft_ms = out.ttft_ms,
                "turn finished"
            );
            Ok(())
        }
        Err(e) if e.is_capacity() => {
            println!();
            tracing::warn!("{e}");
            println!("(context is full; use /clear to start over)");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    utils::init_logging(&args.log_level);
    let mut session = build_session(&args)?;

    if let Some(prompts) = &args.prompts {
        for prompt in prompts {
            println!("> {prompt}");
            chat_once(&mut session, prompt)?;
        }
        return Ok(());
    }

    println!("Enter a prompt (/clear restarts the chat, /quit exits):");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                session.clear_context()?;
                println!("(context cleared)");
            }
            msg => chat_once(&mut session, msg)?,
        }
    }
    Ok(())
}
