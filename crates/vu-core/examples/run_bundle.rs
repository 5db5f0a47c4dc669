//! Run a tiny scripted load test end to end.
//!
//! No network access required — the script only does arithmetic and
//! `console` calls. Demonstrates the core workflow:
//!
//! 1. Compile a script into a `Bundle`
//! 2. Run `setup()` once
//! 3. Mint a few VUs and run one iteration on each
//! 4. Drain the samples channel and print what came out
//!
//! Run with: cargo run --example run_bundle

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use vu_core::bundle::Bundle;
use vu_core::fs::{MemoryFilesystem, VirtualFilesystem};
use vu_core::registry::ModuleRegistry;
use vu_core::runner::Runner;
use vu_core::ActiveVU;
use vu_types::{Group, TagSet};

const SCRIPT: &str = r#"
fn setup() {
    #{ greeting: "hello from setup" }
}

fn default(data) {
    data.greeting
}
"#;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("Step 1: compiling the script into a Bundle...\n");
    let mut filesystems: HashMap<String, Box<dyn VirtualFilesystem>> = HashMap::new();
    filesystems.insert("file".to_string(), Box::new(MemoryFilesystem::new()));
    let bundle = Bundle::compile(
        "file:main.rhai",
        SCRIPT.as_bytes(),
        filesystems,
        Default::default(),
    )?;
    println!("   exports: {:?}\n", bundle.exported_names());

    println!("Step 2: starting a Runner and running setup()...\n");
    let (runner, mut samples) = Runner::new(bundle, Arc::new(ModuleRegistry::new()))?;
    runner.setup().await?;

    println!("Step 3: minting 3 VUs and running one iteration each...\n");
    for _ in 0..3 {
        let vu = runner.new_vu()?;
        let active = ActiveVU::activate(vu, runner.cancel_receiver());
        let outcome = active.run_once(None, Group::root(), TagSet::new()).await?;
        println!("   vu={} iteration={} error={:?}", outcome.trail.vu_id, outcome.trail.iteration, outcome.error);
    }

    println!("\nStep 4: draining samples...\n");
    let drained = Runner::drain_samples(&mut samples, Duration::from_millis(100)).await;
    for sample in &drained {
        println!("   {sample:?}");
    }

    Ok(())
}
