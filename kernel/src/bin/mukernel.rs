//! μKernel CLI
//!
//! Runs small demonstration workloads on a kernel instance.
//!
//! # Usage
//!
//! ```bash
//! # Parent, children and a higher-priority grandchild
//! mukernel demo family
//!
//! # Two processes sharing one priority level
//! mukernel -v demo round-robin
//!
//! # Show the effective configuration
//! mukernel --config kernel.json config
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use mukernel::{Kernel, KernelConfig, MailboxError, ManualClock, ProcessError};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// μKernel - teaching kernel for μOS
#[derive(Parser)]
#[command(name = "mukernel")]
#[command(author = "μOS Project")]
#[command(version)]
#[command(about = "Run μKernel demonstration workloads", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "MUKERNEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a kernel and run one scenario
    Demo {
        /// Scenario to run
        #[arg(value_enum)]
        scenario: Scenario,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// fork, join and priority preemption
    Family,
    /// timeslice rotation within one priority level
    RoundRobin,
    /// producer and consumer over a bounded mailbox
    Pipeline,
    /// zero-capacity mailbox in both arrival orders
    Rendezvous,
    /// releasing a mailbox with blocked receivers
    Release,
}

const STACK: usize = 4 * mukernel::MIN_STACK;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };

    // Setup logging
    let log_level = match cli.verbose {
        0 => config.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    match cli.command {
        Commands::Demo { scenario } => run_demo(config, scenario)?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}

/// Boot a kernel on a simulated clock so every trace is reproducible
fn run_demo(config: KernelConfig, scenario: Scenario) -> Result<(), Box<dyn std::error::Error>> {
    let clock = Arc::new(ManualClock::new());
    let kernel = Kernel::with_clock(config, clock.clone())?;

    info!("Running {:?} demo", scenario);

    let status = match scenario {
        Scenario::Family => kernel.run(family),
        Scenario::RoundRobin => kernel.run(move |k| round_robin(k, clock)),
        Scenario::Pipeline => kernel.run(pipeline),
        Scenario::Rendezvous => kernel.run(rendezvous),
        Scenario::Release => kernel.run(release),
    }?;

    println!("\nkernel halted with status {}", status);
    Ok(())
}

fn family(k: &Kernel) -> i32 {
    let parent = k.fork("P1", STACK, 3, |k| {
        let me = k.getpid();
        println!("P1 ({}) started", me);

        let p2 = k.fork("P2", STACK, 3, |k| {
            println!("P2 ({}) running", k.getpid());
            2
        });
        println!("P1 forked P2: {:?}", p2);

        let p3 = k.fork("P3", STACK, 1, |k| {
            println!("P3 ({}) preempted its parent and runs first", k.getpid());
            3
        });
        println!("P1 forked P3: {:?}", p3);

        println!("{}", k.dump_processes());

        loop {
            match k.join() {
                Ok((child, status)) => println!("P1 joined {} with status {}", child, status),
                Err(ProcessError::NoChildren) => {
                    println!("P1 has no more children");
                    break;
                }
                Err(e) => println!("P1 join failed: {}", e),
            }
        }
        1
    });

    if let Ok((child, status)) = k.join() {
        println!("main joined {:?}/{} with status {}", parent, child, status);
    }
    0
}

fn round_robin(k: &Kernel, clock: Arc<ManualClock>) -> i32 {
    for name in ["A", "B"] {
        let clock = clock.clone();
        let forked = k.fork(name, STACK, 2, move |k| {
            for round in 0..3 {
                println!("{} round {} at {}us", name, round, k.current_time());
                clock.advance(Duration::from_millis(50));
                k.clock_interrupt();
            }
            println!("{} used {}us of CPU", name, k.read_time());
            0
        });
        if let Err(e) = forked {
            println!("could not fork {}: {}", name, e);
            return 1;
        }
    }

    for _ in 0..2 {
        let _ = k.join();
    }
    println!("{} clock interrupts delivered", k.ticks());
    0
}

fn pipeline(k: &Kernel) -> i32 {
    let mbox = match k.mbox_create(2, 32) {
        Ok(id) => id,
        Err(e) => {
            println!("mailbox creation failed: {}", e);
            return 1;
        }
    };

    let _ = k.fork("producer", STACK, 2, move |k| {
        for i in 0..5 {
            let message = format!("item {}", i);
            match k.mbox_send(mbox, message.as_bytes()) {
                Ok(()) => println!("producer sent {:?}", message),
                Err(e) => println!("producer failed: {}", e),
            }
        }
        0
    });

    let _ = k.fork("consumer", STACK, 3, move |k| {
        let mut buf = [0u8; 32];
        for _ in 0..5 {
            match k.mbox_recv(mbox, &mut buf) {
                Ok(len) => println!("consumer got {:?}", String::from_utf8_lossy(&buf[..len])),
                Err(e) => println!("consumer failed: {}", e),
            }
        }
        0
    });

    for _ in 0..2 {
        let _ = k.join();
    }
    let _ = k.mbox_release(mbox);
    0
}

fn rendezvous(k: &Kernel) -> i32 {
    let mbox = match k.mbox_create(0, 0) {
        Ok(id) => id,
        Err(e) => {
            println!("mailbox creation failed: {}", e);
            return 1;
        }
    };

    // receiver first, then sender first
    let _ = k.fork("waiter", STACK, 2, move |k| {
        println!("waiter blocks in receive");
        println!("waiter receive returned {:?}", k.mbox_recv(mbox, &mut []));
        println!("waiter blocks in send");
        println!("waiter send returned {:?}", k.mbox_send(mbox, &[]));
        0
    });

    println!("main sends");
    println!("main send returned {:?}", k.mbox_send(mbox, &[]));
    println!("main receives");
    println!("main receive returned {:?}", k.mbox_recv(mbox, &mut []));

    let _ = k.join();
    0
}

fn release(k: &Kernel) -> i32 {
    let mbox = match k.mbox_create(1, 8) {
        Ok(id) => id,
        Err(e) => {
            println!("mailbox creation failed: {}", e);
            return 1;
        }
    };

    for name in ["reader-1", "reader-2"] {
        let _ = k.fork(name, STACK, 2, move |k| {
            let mut buf = [0u8; 8];
            match k.mbox_recv(mbox, &mut buf) {
                Err(MailboxError::Released) => println!("{} saw the mailbox go away", name),
                other => println!("{} got {:?}", name, other),
            }
            0
        });
    }

    println!("{:?}", k.mbox_info(mbox));
    println!("main releases mailbox {}", mbox);
    let _ = k.mbox_release(mbox);

    for _ in 0..2 {
        let _ = k.join();
    }
    println!("mailbox {} in use afterwards: {}", mbox, k.mbox_info(mbox).is_some());
    0
}
