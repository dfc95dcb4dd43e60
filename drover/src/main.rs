//! Command-line front end for the drover job queue.
//!
//! Every run loads the job definition file, builds a [`Queue`] and then
//! performs the requested actions in a fixed order, so that e.g.
//! `drover -p -c -s` prepares, starts and reports in one invocation.

use std::path::PathBuf;

use clap::{CommandFactory, Parser};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use drover::{Config, Queue, QueueError, StartBudget};

/// Spread long-running jobs over the available nodes and keep an eye on them.
#[derive(Parser, Debug)]
#[command(name = "drover", version, about = "distribute jobs over available nodes")]
struct Args {
    /// job definition file
    #[arg(long, default_value = "drover.yaml")]
    config: PathBuf,

    /// show the configured jobs and their weights
    #[arg(short, long)]
    list: bool,

    /// probe all nodes and show their free slots
    #[arg(short, long)]
    availability: bool,

    /// show how jobs would spread over the nodes, without starting anything
    #[arg(short, long)]
    distribute: bool,

    /// create all job directories and stage their input files
    #[arg(short, long)]
    prepare: bool,

    /// start jobs (use -z, -w or -q to say how many)
    #[arg(short = 'c', long)]
    start: bool,

    /// kill all running jobs
    #[arg(short, long)]
    kill: bool,

    /// remove all job directories
    #[arg(short, long)]
    remove: bool,

    /// run the repair command of every prepared job
    #[arg(short = 'g', long)]
    fix: bool,

    /// show a status table with one line per status
    #[arg(short, long)]
    status: bool,

    /// keep refreshing the status table until nothing is running
    #[arg(short, long)]
    monitor: bool,

    /// print the collected results of all completed jobs as yaml
    #[arg(short = 'x', long)]
    summary: bool,

    /// allow destructive operations on running or completed jobs
    #[arg(short, long)]
    force: bool,

    /// make crashed jobs eligible for starting again
    #[arg(short = 'e', long)]
    restart: bool,

    /// with -c, start every eligible job
    #[arg(short = 'z', long)]
    all: bool,

    /// with -c, start jobs up to this total weight
    #[arg(short, long)]
    weight: Option<f64>,

    /// with -c, top up until this much weight is running
    #[arg(short = 'q', long)]
    limit: Option<f64>,

    /// run job operations one after another instead of in a worker pool
    #[arg(short = 'j', long)]
    serial: bool,

    /// more logging, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn wants_action(&self) -> bool {
        self.list
            || self.availability
            || self.distribute
            || self.prepare
            || self.start
            || self.kill
            || self.remove
            || self.fix
            || self.status
            || self.monitor
            || self.summary
    }

    fn budget(&self) -> StartBudget {
        if self.all {
            if self.weight.is_some() || self.limit.is_some() {
                warn!("-z/--all starts everything, ignoring the weight and limit budgets");
            }
            StartBudget::Everything
        } else if let Some(ceiling) = self.limit {
            if self.weight.is_some() {
                warn!("-q/--limit takes precedence, ignoring -w/--weight");
            }
            StartBudget::Limit(ceiling)
        } else if let Some(weight) = self.weight {
            StartBudget::Weight(weight)
        } else {
            StartBudget::Everything
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("drover={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(args: &Args) -> Result<(), QueueError> {
    let config = Config::load(&args.config)?;
    let mut queue = Queue::load(&config, args.serial)?;
    queue.force = args.force;
    queue.restart = args.restart;

    if !args.start {
        for (given, flag) in [
            (args.restart, "-e/--restart"),
            (args.all, "-z/--all"),
            (args.weight.is_some(), "-w/--weight"),
            (args.limit.is_some(), "-q/--limit"),
        ] {
            if given {
                warn!("{flag} does nothing without -c/--start");
            }
        }
    }

    if args.list {
        queue.list_jobs();
    }
    if args.availability {
        queue.show_availability()?;
    }
    if args.distribute {
        queue.show_distribution()?;
    }
    if args.prepare {
        queue.prepare_all()?;
    }
    if args.start {
        queue.start(args.budget())?;
    }
    if args.kill {
        queue.kill_all()?;
    }
    if args.remove {
        queue.cleanup_all()?;
    }
    if args.fix {
        queue.fix_all()?;
    }
    if args.status {
        let report = queue.refresh_status()?;
        queue.show_status(&report, args.verbose > 0);
    }
    if args.monitor {
        queue.monitor()?;
    }
    if args.summary {
        queue.summary()?;
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if !args.wants_action() {
        warn!("no action requested, see the help below");
        let _ = Args::command().print_help();
        return;
    }

    if let Err(error) = run(&args) {
        error!("{error}");
        std::process::exit(1);
    }
}
