use simulation::{simulate_replication, simulate_scaling};
use tracing_subscriber::EnvFilter;

pub mod simulation;

#[tokio::main]
async fn main() -> mdrl_replica::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICATION SIMULATIONS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Small network, two replicas per gid
    let stats = simulate_replication(4, 25, 2, 1).await?;
    stats.print();

    // Medium network, three replicas per gid
    let stats = simulate_replication(10, 50, 3, 2).await?;
    stats.print();

    simulate_scaling(16, 4).await?;

    println!("\n✓ All simulations completed successfully!");
    Ok(())
}
