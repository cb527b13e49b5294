//! plugbridge - plugin bridge demo
//!
//! Runs a few instances of a plugin directly, on the DSP thread pool or in
//! a bridge process and reports their output level and timing.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use plugbridge_core::{BridgeConfig, Sample};
use plugbridge_ipc::{PluginBridge, PluginClient};
use plugbridge_plugin::{Plugin, PluginListener, ProcessData, ProcessMode, builtin};
use plugbridge_threaded::ThreadedPlugin;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Call the plugin on the audio thread
    Direct,
    /// Process on the DSP thread pool
    Threaded,
    /// One host process per instance
    Sandbox,
    /// All instances in one shared host process
    Shared,
}

/// Plugin bridge demo
#[derive(Parser, Debug)]
#[command(name = "plugbridge")]
#[command(about = "Run plugins on worker threads or in bridge processes", long_about = None)]
struct Args {
    /// Plugin path
    #[arg(short, long, default_value = "builtin:gain")]
    plugin: String,

    #[arg(short, long, value_enum, default_value_t = Mode::Shared)]
    mode: Mode,

    /// Number of plugin instances
    #[arg(short = 'n', long, default_value_t = 4)]
    instances: usize,

    /// Number of blocks to process
    #[arg(short, long, default_value_t = 200)]
    blocks: usize,

    /// Processing block size
    #[arg(long, default_value_t = 256)]
    block_size: usize,

    /// Value of the first parameter
    #[arg(long, default_value_t = 0.5)]
    value: f32,

    /// Bridge configuration (.ron)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the default configuration to this file and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

const SAMPLE_RATE: f64 = 48000.0;

/// Logs whatever the plugins report
struct LogListener {
    instance: usize,
}

impl PluginListener for LogListener {
    fn parameter_automated(&self, index: usize, value: f32) {
        tracing::info!("#{}: parameter {} automated to {}", self.instance, index, value);
    }

    fn latency_changed(&self, samples: u32) {
        tracing::info!("#{}: latency is now {} samples", self.instance, samples);
    }

    fn plugin_crashed(&self) {
        tracing::error!("#{}: plugin crashed", self.instance);
    }
}

struct Instance {
    plugin: Box<dyn Plugin>,
    bridge: Option<Arc<PluginBridge>>,
    peak: Sample,
}

fn create_instance(args: &Args, index: usize) -> Result<Instance> {
    let load = || {
        builtin::load_path(&args.plugin)
            .with_context(|| format!("Unknown plugin '{}'", args.plugin))
    };

    let (mut plugin, bridge): (Box<dyn Plugin>, _) = match args.mode {
        Mode::Direct => (load()?, None),
        Mode::Threaded => (Box::new(ThreadedPlugin::new(load()?)), None),
        Mode::Sandbox | Mode::Shared => {
            let client = PluginClient::new(&args.plugin, args.mode == Mode::Sandbox)
                .with_context(|| format!("Failed to bridge '{}'", args.plugin))?;
            let bridge = Arc::clone(client.bridge());
            (Box::new(client), Some(bridge))
        }
    };

    plugin.set_listener(Some(Arc::new(LogListener { instance: index })));
    plugin
        .setup_processing(SAMPLE_RATE, args.block_size, ProcessMode::Realtime)
        .context("Failed to set up processing")?;
    plugin.resume();
    plugin.set_parameter(0, args.value, 0);

    Ok(Instance {
        plugin,
        bridge,
        peak: 0.0,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plugbridge=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if let Some(path) = &args.write_config {
        BridgeConfig::default()
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    if let Some(path) = &args.config {
        let config = BridgeConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        BridgeConfig::install(config)?;
    }

    let mut instances = (0..args.instances)
        .map(|index| create_instance(&args, index))
        .collect::<Result<Vec<_>>>()?;

    if let Some(first) = instances.first() {
        let info = first.plugin.info();
        println!("Plugin:    {} by {} ({})", info.name, info.vendor, info.version);
        println!("Channels:  {} in, {} out", info.num_inputs, info.num_outputs);
        println!("Mode:      {:?}, {} instances", args.mode, args.instances);
    }

    let n = args.block_size;
    let input: Vec<Sample> = (0..n)
        .map(|i| (i as f64 * 440.0 * std::f64::consts::TAU / SAMPLE_RATE).sin() as Sample)
        .collect();
    let mut output_l = vec![0.0; n];
    let mut output_r = vec![0.0; n];

    let start = Instant::now();
    for _ in 0..args.blocks {
        for instance in &mut instances {
            let inputs: [&[Sample]; 2] = [&input, &input];
            let mut outputs: [&mut [Sample]; 2] = [&mut output_l, &mut output_r];
            instance.plugin.process(&mut ProcessData {
                inputs: &inputs,
                outputs: &mut outputs,
                num_samples: n,
            });
            let peak = output_l.iter().fold(0.0, |acc: Sample, s| acc.max(s.abs()));
            instance.peak = instance.peak.max(peak);
        }
        for bridge in instances.iter().filter_map(|i| i.bridge.as_ref()) {
            bridge.poll_ui_thread();
        }
    }
    let elapsed = start.elapsed();

    let audio_seconds = (args.blocks * n) as f64 / SAMPLE_RATE;
    println!(
        "Processed {:.2} s of audio per instance in {:.1} ms ({:.0}x real time)",
        audio_seconds,
        elapsed.as_secs_f64() * 1000.0,
        audio_seconds / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    for (index, instance) in instances.iter().enumerate() {
        println!(
            "  #{}: peak {:.3}, parameter 0 = {} ({})",
            index,
            instance.peak,
            instance.plugin.parameter(0),
            instance.plugin.parameter_string(0)
        );
    }

    Ok(())
}
