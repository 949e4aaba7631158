//! Interactive demo host for the engine.
//!
//! Activates a model, ticks `process()` on a fixed interval printing tokens
//! as they arrive, and forwards stdin lines into the running generation via
//! `insert_prompt`.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use llamatick::runtime::llama_cpp::LlamaCppFactory;
use llamatick::{ActivateParams, Engine};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(model_path) = args.next() else {
        eprintln!("usage: llamatick <model.gguf> [prompt] [stop-sequence]...");
        std::process::exit(2);
    };
    let prompt = args.next().unwrap_or_else(|| "Hello".to_string());
    let stop_sequences: Vec<String> = args.collect();

    let engine = Engine::new(LlamaCppFactory::default());
    engine.activate(
        false,
        ActivateParams {
            prompt,
            model_path: PathBuf::from(model_path),
            stop_sequences,
        },
    );

    // Stdin lines become mid-generation input.
    let (line_tx, line_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        engine.process(|token| {
            print!("{token}");
            let _ = std::io::stdout().flush();
        });
        while let Ok(line) = line_rx.try_recv() {
            engine.insert_prompt(line);
        }
        thread::sleep(Duration::from_millis(50));
    }
}
