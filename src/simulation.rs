use async_stream::stream;
use futures::stream::{Stream, StreamExt};
use mdrl_log::{AppendOptions, Hash};
use mdrl_net::MemoryNetwork;
use mdrl_replica::{Node, NodeConfig, OpenOptions, Program, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const PROGRAM: &str = "simulation";

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub num_nodes: usize,
    pub writes_per_node: usize,
    pub min_replicas: usize,
    pub total_entries: usize,
    /// Entries held by at least `min_replicas` nodes
    pub replicated_entries: usize,
    /// Entries held across all nodes, duplicates included
    pub stored_entries: usize,
    pub convergence_time: Duration,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Replication Statistics                        ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Nodes:                     {:>30} ║", self.num_nodes);
        println!("║  Writes per Node:           {:>30} ║", self.writes_per_node);
        println!("║  Replicas per Gid:          {:>30} ║", self.min_replicas);
        println!("║  Distinct Entries:          {:>30} ║", self.total_entries);
        println!("║  Fully Replicated:          {:>30} ║", self.replicated_entries);
        println!("║  Stored Copies:             {:>30} ║", self.stored_entries);
        println!("║  Convergence Time:          {:>29}s ║", format!("{:.3}", self.convergence_time.as_secs_f64()));
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Yields random pairs of node indices to link
fn link_generator(num_nodes: usize, num_links: usize, seed: u64) -> impl Stream<Item = (usize, usize)> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        // a chain first so the graph is connected
        for i in 1..num_nodes {
            yield (i - 1, i);
        }
        for _ in 0..num_links {
            yield (rng.gen_range(0..num_nodes), rng.gen_range(0..num_nodes));
        }
    }
}

fn peer_name(index: usize) -> String {
    format!("node-{:02}", index)
}

/// Copies of each entry across the given programs
async fn holders(programs: &[Arc<Program<u64>>]) -> HashMap<Hash, usize> {
    let mut counts: HashMap<Hash, usize> = HashMap::new();
    for program in programs {
        let Ok(store) = program.store(0) else { continue };
        for entry in store.values().await {
            *counts.entry(*entry.hash()).or_default() += 1;
        }
    }
    counts
}

/// Starts `num_nodes` nodes on a random connected graph, writes from every
/// node and waits until every entry sits on `min_replicas` nodes.
pub async fn simulate_replication(
    num_nodes: usize,
    writes_per_node: usize,
    min_replicas: usize,
    seed: u64,
) -> Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Replication Simulation                              ║");
    println!("║  Nodes: {} | Writes/Node: {} | Replicas: {}", num_nodes, writes_per_node, min_replicas);
    println!("╚════════════════════════════════════════════════════════════╝");

    let network = MemoryNetwork::new();
    let config = NodeConfig::builder()
        .min_replicas(min_replicas)
        .exchange_timeout(Duration::from_secs(2))
        .build();

    let mut nodes = Vec::with_capacity(num_nodes);
    for i in 0..num_nodes {
        let node = Node::builder(Arc::new(network.join(peer_name(i))))
            .config(config.clone())
            .build()?;
        nodes.push(node);
    }

    println!("\n[Phase 1/3] Linking nodes...");
    let mut links = Box::pin(link_generator(num_nodes, num_nodes, seed));
    while let Some((a, b)) = links.next().await {
        network.connect(&peer_name(a), &peer_name(b)).await?;
    }

    let mut programs = Vec::with_capacity(num_nodes);
    for node in &nodes {
        programs.push(node.open::<u64>(PROGRAM, OpenOptions::new()).await?);
    }
    println!("[Phase 1/3] ✓ Completed");

    println!("[Phase 2/3] Writing entries...");
    let start = Instant::now();
    let mut handles = vec![];
    for (idx, program) in programs.iter().enumerate() {
        let program = Arc::clone(program);
        handles.push(tokio::spawn(async move {
            for i in 0..writes_per_node {
                let value = ((idx as u64) << 32) | (i as u64);
                // every write starts its own gid
                let options = AppendOptions::new().with_next(vec![]);
                if let Err(err) = program.append(0, value, options).await {
                    warn!(node = idx, error = %err, "Append failed");
                }
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    println!("[Phase 2/3] ✓ Completed");

    println!("[Phase 3/3] Waiting for replication...");
    let target = min_replicas.min(num_nodes);
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut counts = holders(&programs).await;
    while counts.values().any(|n| *n < target) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        counts = holders(&programs).await;
    }
    let convergence_time = start.elapsed();
    println!("[Phase 3/3] ✓ Completed");

    for node in &nodes {
        node.stop().await?;
    }

    let stats = SimulationStats {
        num_nodes,
        writes_per_node,
        min_replicas,
        total_entries: counts.len(),
        replicated_entries: counts.values().filter(|n| **n >= target).count(),
        stored_entries: counts.values().sum(),
        convergence_time,
    };
    info!(
        nodes = num_nodes,
        entries = stats.total_entries,
        replicated = stats.replicated_entries,
        "Simulation finished"
    );
    Ok(stats)
}

/// Runs the simulation at growing node counts
pub async fn simulate_scaling(max_nodes: usize, step_size: usize) -> Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Replication vs Node Count         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current = step_size;
    while current <= max_nodes {
        let stats = simulate_replication(current, 20, 2, current as u64).await?;
        stats.print();
        current += step_size;
    }
    Ok(())
}
