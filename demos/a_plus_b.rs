//! A + B over the lock-step channel
//!
//! The agent process creates the region and spawns the simulation process,
//! which sends operand pairs and checks every sum the agent returns.
//!
//! ```text
//! cargo run --release --example a_plus_b -- agent --rounds 10000
//! cargo run --release --example a_plus_b -- agent --batch
//! RUST_LOG=lockstep_ipc=debug cargo run --example a_plus_b -- agent
//! ```

use clap::{Args, Parser, Subcommand};
use lockstep_ipc::{
    Batch, Endpoint, EndpointConfig, Envelope, ObjectNames, Role, Side, Single,
};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Operands {
    a: u32,
    b: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Sum {
    c: u32,
}

unsafe impl Envelope for Operands {}
unsafe impl Envelope for Sum {}

type Error = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(name = "a_plus_b", about = "Lock-step A + B between two processes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Shared {
    /// Number of rounds the simulation runs
    #[arg(short, long, default_value = "1000")]
    rounds: u32,

    /// Exchange a batch of pairs per round instead of a single pair
    #[arg(long)]
    batch: bool,

    /// Suffix appended to every shared memory name
    #[arg(long)]
    suffix: Option<String>,

    /// Give up when the peer is silent this long
    #[arg(long, default_value = "10")]
    timeout_secs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the region, spawn the simulation and answer its operands
    Agent(Shared),
    /// Attach to the region and drive the rounds (spawned by `agent`)
    Sim(Shared),
}

fn config(role: Role, side: Side, shared: &Shared) -> EndpointConfig {
    let names = match &shared.suffix {
        Some(suffix) => ObjectNames::default().with_suffix(suffix),
        None => ObjectNames::default(),
    };
    EndpointConfig::new(role, side)
        .with_names(names)
        .with_size(64 * 1024)
        .with_handle_finish(true)
        .with_timeout(Duration::from_secs(shared.timeout_secs))
}

fn operands(round: u32, i: u32) -> Operands {
    Operands {
        a: round.wrapping_mul(7).wrapping_add(i) % 1000,
        b: round.wrapping_mul(13).wrapping_add(3 * i) % 1000,
    }
}

fn run_agent(mut shared: Shared) -> Result<(), Error> {
    let suffix = shared
        .suffix
        .get_or_insert_with(|| std::process::id().to_string())
        .clone();
    let config = config(Role::Creator, Side::Agent, &shared);

    // Objects exist before the simulation is started
    let mut single = None;
    let mut batch = None;
    if shared.batch {
        batch = Some(Endpoint::<Sum, Operands, Batch>::new(&config)?);
    } else {
        single = Some(Endpoint::<Sum, Operands, Single>::new(&config)?);
    }

    let mut child = Command::new(std::env::current_exe()?);
    child
        .arg("sim")
        .arg("--rounds")
        .arg(shared.rounds.to_string())
        .arg("--suffix")
        .arg(&suffix)
        .arg("--timeout-secs")
        .arg(shared.timeout_secs.to_string());
    if shared.batch {
        child.arg("--batch");
    }
    let mut child = child.spawn()?;
    tracing::info!(pid = child.id(), "spawned simulation");

    let start = Instant::now();
    let mut answered = 0u64;
    if let Some(agent) = single.as_mut() {
        while let Some(ops) = agent.recv_value()? {
            agent.send_value(Sum { c: ops.a + ops.b })?;
            answered += 1;
        }
    } else if let Some(agent) = batch.as_mut() {
        while let Some(pairs) = agent.recv_vec()? {
            let mut sums = agent.send()?;
            sums.clear();
            for ops in &pairs {
                sums.push(Sum { c: ops.a + ops.b })?;
            }
            answered += pairs.len() as u64;
        }
    }

    let status = child.wait()?;
    let elapsed = start.elapsed();
    println!(
        "[Agent] answered {} sums in {:.3}s ({:.0} rounds/s), simulation exited with {}",
        answered,
        elapsed.as_secs_f64(),
        shared.rounds as f64 / elapsed.as_secs_f64(),
        status
    );
    if !status.success() {
        return Err("simulation failed".into());
    }
    Ok(())
}

fn run_sim(shared: Shared) -> Result<(), Error> {
    let config = config(Role::Attacher, Side::Simulation, &shared);

    if shared.batch {
        let mut sim = Endpoint::<Operands, Sum, Batch>::new(&config)?;
        for round in 0..shared.rounds {
            let pairs: Vec<Operands> = (0..round % 10).map(|i| operands(round, i)).collect();
            sim.send_slice(&pairs)?;
            let sums = sim.recv()?.ok_or("unexpected end-of-stream")?;
            if sums.len() != pairs.len() {
                return Err(format!("round {}: {} sums for {} pairs", round, sums.len(), pairs.len()).into());
            }
            for (ops, sum) in pairs.iter().zip(sums.iter()) {
                if ops.a + ops.b != sum.c {
                    return Err(format!("round {}: {} + {} != {}", round, ops.a, ops.b, sum.c).into());
                }
            }
        }
        sim.set_finished()?;
    } else {
        let mut sim = Endpoint::<Operands, Sum, Single>::new(&config)?;
        for round in 0..shared.rounds {
            let ops = operands(round, 0);
            sim.send_value(ops)?;
            let sum = sim.recv_value()?.ok_or("unexpected end-of-stream")?;
            if ops.a + ops.b != sum.c {
                return Err(format!("round {}: {} + {} != {}", round, ops.a, ops.b, sum.c).into());
            }
        }
        sim.set_finished()?;
    }

    println!("[Sim] {} rounds verified", shared.rounds);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Agent(shared) => run_agent(shared),
        Commands::Sim(shared) => run_sim(shared),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
