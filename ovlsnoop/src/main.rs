use std::{path::PathBuf, sync::Arc};

use anyhow::bail;
use aya::Ebpf;
use aya_log::EbpfLogger;
use clap::Parser;
use thiserror::Error;
use tokio::{runtime::Runtime, signal, sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn, Level};
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

use ovlsnoop::{
    events::{
        read_events, supervise_reader, take_ring_buf, Event, ReaderError, ReaderStats, Tracer,
    },
    ksyms::Ksyms,
    load::{attach_fileops, attach_ovlinuse, load_fileops, load_ovlinuse},
    maps::{set_ovl_config, set_target_comm},
    report::Reporter,
    settings::{Settings, DEFAULT_CONFIG_PATH, ENV_PREFIX},
    sysutils::{bump_memlock_rlimit, check_btf, check_root, SYS_BTF_PATH},
};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    #[cfg_attr(
        debug_assertions,
        arg(
            long,
            env = "OVLSNOOP_LOG_LEVEL",
            default_value = "debug",
            value_parser = ["trace", "debug", "info", "warn", "error"]
        )
    )]
    #[cfg_attr(
        not(debug_assertions),
        arg(
            long,
            env = "OVLSNOOP_LOG_LEVEL",
            default_value = "info",
            value_parser = ["trace", "debug", "info", "warn", "error"]
        )
    )]
    log_level: String,

    #[arg(long, env = "OVLSNOOP_LOG_FMT", default_value = "text", value_parser = ["json", "text"])]
    log_fmt: String,

    /// Process name traced by the file operations tracer.
    #[arg(long)]
    target_comm: Option<String>,

    /// Do not load the file operations tracer.
    #[arg(long)]
    no_fileops: bool,

    /// Do not load the overlay in-use tracer.
    #[arg(long)]
    no_ovlinuse: bool,

    /// Report only failed ovl_inuse_trylock calls, not ovl_is_inuse.
    #[arg(long)]
    no_is_inuse: bool,

    /// Configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

impl Opt {
    /// Applies the command line on top of the file and environment settings.
    fn apply(&self, settings: &mut Settings) {
        if let Some(target_comm) = &self.target_comm {
            settings.target_comm = target_comm.clone();
        }
        if self.no_fileops {
            settings.fileops = false;
        }
        if self.no_ovlinuse {
            settings.ovlinuse = false;
        }
        if self.no_is_inuse {
            settings.trace_is_inuse = false;
        }
    }
}

#[derive(Error, Debug)]
enum SetupTracingError {
    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),

    #[error(transparent)]
    SetGlobalDefault(#[from] tracing_core::dispatcher::SetGlobalDefaultError),

    #[error("unknown log level")]
    UnknownLogLevel,

    #[error("unknown log message format")]
    UnknownLogFormat,
}

fn setup_tracing(opt: &Opt) -> Result<(), SetupTracingError> {
    let (level_tracing, level_log) = match opt.log_level.as_str() {
        "trace" => (Level::TRACE, log::LevelFilter::Trace),
        "debug" => (Level::DEBUG, log::LevelFilter::Debug),
        "info" => (Level::INFO, log::LevelFilter::Info),
        "warn" => (Level::WARN, log::LevelFilter::Warn),
        "error" => (Level::ERROR, log::LevelFilter::Error),
        _ => return Err(SetupTracingError::UnknownLogLevel),
    };

    let builder = FmtSubscriber::builder().with_max_level(level_tracing);
    match opt.log_fmt.as_str() {
        "json" => {
            let subscriber = builder.json().finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "text" => {
            let subscriber = builder.finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        _ => return Err(SetupTracingError::UnknownLogFormat),
    };

    LogTracer::builder().with_max_level(level_log).init()?;

    Ok(())
}

/// Forwards the kernel-side log records of a program. Failing to do so does
/// not prevent tracing.
fn init_ebpf_logger(ebpf: &mut Ebpf, tracer: Tracer) {
    if let Err(e) = EbpfLogger::init(ebpf) {
        debug!(
            tracer = tracer.as_str(),
            error = e.to_string().as_str(),
            "could not initialize eBPF logger"
        );
    }
}

/// A tracer whose programs are attached and whose ring buffer is being read.
struct Running {
    tracer: Tracer,
    // Dropping the handle detaches the programs.
    _ebpf: Ebpf,
    stats: Arc<ReaderStats>,
    reader: JoinHandle<Result<(), ReaderError>>,
}

fn spawn_reader(
    tracer: Tracer,
    mut ebpf: Ebpf,
    tx: &mpsc::Sender<Event>,
) -> Result<Running, ReaderError> {
    let ring_buf = take_ring_buf(&mut ebpf)?;
    let stats = Arc::new(ReaderStats::default());
    let reader = tokio::spawn(supervise_reader(
        tracer,
        stats.clone(),
        read_events(tracer, ring_buf, tx.clone(), stats.clone()),
    ));
    Ok(Running {
        tracer,
        _ebpf: ebpf,
        stats,
        reader,
    })
}

/// Loads and attaches the enabled tracers, then reports their records until
/// interrupted.
async fn ovlsnoop(settings: Settings) -> Result<(), anyhow::Error> {
    check_root()?;
    check_btf(SYS_BTF_PATH)?;
    if let Err(e) = bump_memlock_rlimit() {
        debug!(error = e.to_string().as_str(), "could not raise memlock limit");
    }

    let ksyms = match Ksyms::load() {
        Ok(ksyms) => Some(ksyms),
        Err(e) => {
            warn!(error = e.to_string().as_str(), "kernel symbols unavailable");
            None
        }
    };

    let (tx, mut rx) = mpsc::channel::<Event>(settings.channel_capacity);
    let mut running = Vec::new();

    if settings.fileops {
        if settings.target_comm.is_empty() {
            warn!("target_comm is empty, the file operations tracer reports nothing");
        }
        let mut ebpf = load_fileops()?;
        init_ebpf_logger(&mut ebpf, Tracer::FileOps);
        set_target_comm(&mut ebpf, &settings.target_comm)?;
        attach_fileops(&mut ebpf)?;
        info!(target_comm = settings.target_comm.as_str(), "file operations tracer attached");
        running.push(spawn_reader(Tracer::FileOps, ebpf, &tx)?);
    }

    if settings.ovlinuse {
        let ksyms = match &ksyms {
            Some(ksyms) => ksyms,
            None => bail!("the overlay in-use tracer needs {}", ovlsnoop::ksyms::PROC_KALLSYMS),
        };
        let mut ebpf = load_ovlinuse()?;
        init_ebpf_logger(&mut ebpf, Tracer::OvlInuse);
        set_ovl_config(&mut ebpf, settings.trace_is_inuse)?;
        attach_ovlinuse(&mut ebpf, ksyms)?;
        info!(
            trace_is_inuse = settings.trace_is_inuse,
            "overlay in-use tracer attached"
        );
        running.push(spawn_reader(Tracer::OvlInuse, ebpf, &tx)?);
    }

    if running.is_empty() {
        bail!("both tracers are disabled");
    }
    // Only the readers hold senders from now on.
    drop(tx);

    let mut reporter = Reporter::new(ksyms, settings.pair_window());
    tokio::select! {
        _ = reporter.run(&mut rx) => {
            warn!("all readers stopped");
        }
        res = signal::ctrl_c() => {
            res?;
            info!("received Ctrl+C, shutting down");
        }
    }

    let stats: Vec<_> = running
        .iter()
        .map(|r| (r.tracer, r.stats.as_ref()))
        .collect();
    reporter.log_stats(&stats);

    for r in running {
        if r.reader.is_finished() {
            // Reader errors were logged when they happened.
            if let Err(e) = r.reader.await {
                error!(
                    tracer = r.tracer.as_str(),
                    error = e.to_string().as_str(),
                    "reader panicked"
                );
            }
        } else {
            r.reader.abort();
        }
    }

    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();
    setup_tracing(&opt)?;

    let mut settings = Settings::load(&opt.config, ENV_PREFIX)?;
    opt.apply(&mut settings);
    debug!(?settings, "settings");

    let rt = Runtime::new()?;
    rt.block_on(ovlsnoop(settings))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_settings() {
        let opt = Opt::parse_from([
            "ovlsnoop",
            "--target-comm",
            "mkdir",
            "--no-ovlinuse",
            "--no-is-inuse",
        ]);
        let mut settings = Settings {
            target_comm: String::new(),
            fileops: true,
            ovlinuse: true,
            trace_is_inuse: true,
            pair_window_ms: 1000,
            channel_capacity: 1024,
        };
        opt.apply(&mut settings);

        assert_eq!(settings.target_comm, "mkdir");
        assert!(settings.fileops);
        assert!(!settings.ovlinuse);
        assert!(!settings.trace_is_inuse);
    }

    #[test]
    fn log_options_are_validated() {
        assert!(Opt::try_parse_from(["ovlsnoop", "--log-fmt", "xml"]).is_err());
        assert!(Opt::try_parse_from(["ovlsnoop", "--log-level", "loud"]).is_err());
        let opt = Opt::try_parse_from(["ovlsnoop", "--log-fmt", "json"]).unwrap();
        assert_eq!(opt.log_fmt, "json");
    }
}
