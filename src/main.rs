use anyhow::Result;
use simulation::{simulate_household, simulate_scaling};
use tracing_subscriber::EnvFilter;

pub mod simulation;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<()> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            OFFLINE SYNC SIMULATIONS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Run 1: a couple of phones, a short shopping trip
    let stats = simulate_household(2, 40, 8, 7).await?;
    stats.print();

    // Run 2: a busy household
    let stats = simulate_household(5, 120, 20, 42).await?;
    stats.print();

    // Run 3: scaling by device count
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    simulate_scaling(8, 2).await?;

    println!("\n✓ All simulations converged!");
    Ok(())
}
