use anyhow::{Context, Result, bail};
use clap::{Arg, Command, value_parser};
use framebridge::config::{app_name, version};
use framebridge::pipeline::{LoopbackOptions, LoopbackPipeline, MediaPipeline};
use framebridge::{BridgeConfig, Caps, DiscardPolicy, FrameBuffer, PipelineSupervisor};
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const WIDTH: usize = 64;
const HEIGHT: usize = 48;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON file with bridge settings.")
                .required(false),
        )
        .arg(
            Arg::new("frames")
                .short('n')
                .long("frames")
                .value_name("COUNT")
                .help("Number of frames to push through the loopback pipeline.")
                .value_parser(value_parser!(u64))
                .default_value("100"),
        )
        .arg(
            Arg::new("policy")
                .short('p')
                .long("policy")
                .value_name("POLICY")
                .help("Which side discards frames when the bridge is full (input/output).")
                .value_parser(["input", "output"])
                .ignore_case(true)
                .required(false),
        )
        .arg(
            Arg::new("drop-every")
                .long("drop-every")
                .value_name("K")
                .help("Let the pipeline silently drop every K-th frame (0 disables).")
                .value_parser(value_parser!(u64))
                .default_value("0"),
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => BridgeConfig::from_path(path)
            .with_context(|| format!("unable to load configuration from {}", path))?,
        None => BridgeConfig::default(),
    };
    if let Some(policy) = matches.get_one::<String>("policy") {
        config.discard_policy = match policy.to_lowercase().as_str() {
            "output" => DiscardPolicy::DiscardOutput,
            _ => DiscardPolicy::DiscardInput,
        };
    }
    config.validate()?;

    let frames = matches.get_one::<u64>("frames").copied().unwrap_or(100);
    let drop_every = matches.get_one::<u64>("drop-every").copied().unwrap_or(0);
    let frame_period = config.frame_period();

    let supervisor: Arc<PipelineSupervisor<u64>> = Arc::new(PipelineSupervisor::new(config));
    let mut loopback_control = None;
    supervisor.initialize(|ingest, egress| {
        let options = LoopbackOptions {
            transform: Some(Arc::new(|data: &mut [u8]| {
                data.iter_mut().for_each(|byte| *byte = !*byte)
            })),
            ..LoopbackOptions::default()
        };
        let pipeline = LoopbackPipeline::new(ingest, egress, options);
        loopback_control = Some(pipeline.control());
        Ok(Box::new(pipeline) as Box<dyn MediaPipeline>)
    })?;
    if let Some(control) = &loopback_control {
        control.set_drop_every(drop_every);
    }

    supervisor.set_input_caps(
        format!("video/x-raw, format=GRAY8, width={}, height={}", WIDTH, HEIGHT)
            .parse::<Caps>()?,
    )?;
    supervisor.set_state_change_callback(|old, new, pending| match pending {
        Some(pending) => info!("State {} -> {} (pending {})", old, new, pending),
        None => info!("State {} -> {}", old, new),
    });

    // gracefully stop the pipeline when receiving SIGINT, SIGTERM, or SIGHUP
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        let supervisor = supervisor.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
            if let Err(e) = supervisor.stop() {
                warn!("Unable to stop pipeline: {}", e);
            }
        })
        .context("Error setting Ctrl-C handler")?;
    }

    supervisor.start()?;
    if let Some(caps) = supervisor.get_output_caps()? {
        info!("Output caps: {}", caps);
    }

    let producing = Arc::new(AtomicBool::new(true));
    let consumer = {
        let supervisor = supervisor.clone();
        let producing = producing.clone();
        thread::Builder::new()
            .name("consumer".to_string())
            .spawn(move || consume(&supervisor, &producing))?
    };

    let mut accepted = 0u64;
    for index in 0..frames {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }

        let mut buffer = FrameBuffer::zeroed(WIDTH * HEIGHT);
        buffer.map_write()?.fill(index as u8);
        buffer.unmap();

        if supervisor.submit(buffer, index)? {
            accepted += 1;
        }
        thread::sleep(frame_period / 4);
    }
    producing.store(false, Ordering::SeqCst);

    let received = match consumer.join() {
        Ok(received) => received?,
        Err(_) => bail!("consumer thread panicked"),
    };

    if let Some(e) = supervisor.take_fatal_error() {
        bail!("bridge failed: {}", e);
    }
    supervisor.stop()?;

    info!(
        "Submitted {} frames, {} accepted, {} received",
        frames, accepted, received
    );
    info!("{}", supervisor.health().summary());
    Ok(())
}

/// Pop matched frames until the producer is done and the queue ran dry
fn consume(supervisor: &PipelineSupervisor<u64>, producing: &AtomicBool) -> Result<u64> {
    let mut received = 0u64;
    let mut last_index = None;

    loop {
        let Some((mut buffer, index)) = supervisor.pop_timeout(Duration::from_millis(500)) else {
            if producing.load(Ordering::SeqCst) {
                continue;
            }
            break;
        };

        if last_index.is_some_and(|last| index <= last) {
            bail!("frame {} arrived after frame {:?}", index, last_index);
        }
        last_index = Some(index);

        let expected = !(index as u8);
        if buffer.map_read()?.iter().any(|&byte| byte != expected) {
            warn!("Frame {} carries unexpected payload", index);
        }
        received += 1;
    }

    Ok(received)
}
