//! Ackgrid simulator: one primary forwarding writes to simulated backups and
//! collecting their acks under injected delays, failures, losses, and
//! topology changes.

mod cluster;

use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

use ackgrid::{logger_init, pf_error, AckgridError, ME};

use cluster::{run_sim, SimParams};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Number of simulated backup nodes.
    #[arg(short, long, default_value_t = 3)]
    backups: u32,

    /// Number of backup owners per segment.
    #[arg(long, default_value_t = 2)]
    copies: u32,

    /// Number of key-space segments.
    #[arg(short, long, default_value_t = 16)]
    segments: u32,

    /// Total number of writes to issue.
    #[arg(short, long, default_value_t = 10000)]
    writes: usize,

    /// Segments touched per write; 1 means single-key writes.
    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Interval between issued writes in microsecs.
    #[arg(long, default_value_t = 100)]
    interval_us: u64,

    /// Maximum simulated backup reply delay in millisecs.
    #[arg(long, default_value_t = 10)]
    max_delay_ms: u64,

    /// Probability of a backup failing a write.
    #[arg(long, default_value_t = 0.01)]
    fail_rate: f64,

    /// Probability of a backup reply getting lost.
    #[arg(long, default_value_t = 0.001)]
    drop_rate: f64,

    /// Activate a new topology every this many writes; 0 means never.
    #[arg(long, default_value_t = 0)]
    rebalance_every: usize,

    /// Ack collector config overrides as a TOML string.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(params)` on success
    /// or `Err(AckgridError)` on any error.
    fn sanitize(&self) -> Result<SimParams, AckgridError> {
        if self.backups == 0 {
            Err(AckgridError::msg(format!(
                "invalid number of backups {}",
                self.backups
            )))
        } else if self.copies == 0 || self.copies > self.backups {
            Err(AckgridError::msg(format!(
                "invalid copies {} with {} backups",
                self.copies, self.backups
            )))
        } else if self.segments < 2 {
            Err(AckgridError::msg(format!(
                "invalid number of segments {}",
                self.segments
            )))
        } else if self.batch == 0 || self.batch >= self.segments as usize {
            Err(AckgridError::msg(format!(
                "invalid batch {} with {} segments",
                self.batch, self.segments
            )))
        } else if self.interval_us == 0 {
            Err(AckgridError::msg(format!(
                "invalid interval_us {}",
                self.interval_us
            )))
        } else if !(0.0..=1.0).contains(&self.fail_rate)
            || !(0.0..=1.0).contains(&self.drop_rate)
            || self.fail_rate + self.drop_rate > 1.0
        {
            Err(AckgridError::msg(format!(
                "invalid fail_rate {} / drop_rate {}",
                self.fail_rate, self.drop_rate
            )))
        } else if self.threads < 2 {
            Err(AckgridError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(SimParams {
                backups: self.backups,
                copies: self.copies,
                segments: self.segments,
                writes: self.writes,
                batch: self.batch,
                interval_us: self.interval_us,
                max_delay_ms: self.max_delay_ms,
                fail_rate: self.fail_rate,
                drop_rate: self.drop_rate,
                rebalance_every: self.rebalance_every,
                config: self.config.clone(),
            })
        }
    }
}

/// Actual main function of the simulator.
fn sim_main() -> Result<(), AckgridError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let params = args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-sim")
            .build()?;

        runtime.block_on(async move {
            let report = run_sim(params, rx_term).await?;
            report.print();

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), AckgridError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the simulator.
fn main() -> ExitCode {
    let _ = ME.set("sim".into());
    logger_init();

    if let Err(ref e) = sim_main() {
        pf_error!("sim_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
