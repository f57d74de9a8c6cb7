//! In-process overlay simulation
//!
//! Run with: cargo run --example overlay_sim [VIEWERS]
//!
//! Starts an origin and VIEWERS viewers (default 5) on an in-memory network,
//! prints the tree after everyone joined, makes the root leave and prints the
//! repaired tree.
//!
//! Set `RUST_LOG=treecast=debug` to watch every assignment and settle.

use std::time::Duration;

use treecast::coordinator::{CoordinatorConfig, CoordinatorHandle, CoordinatorService};
use treecast::node::{NodeConfig, NodeEvent, NodeHandle, NodeService};
use treecast::transport::memory::MemoryNetwork;
use treecast::{MediaStream, PeerId};

async fn print_tree(control: &CoordinatorHandle) -> Result<(), Box<dyn std::error::Error>> {
    let topology = control.topology().await?;
    let mut depths: Vec<_> = topology.depths().into_iter().collect();
    depths.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    println!("Tree ({} viewers):", depths.len());
    for (id, depth) in depths {
        let (left, right) = topology.children(&id);
        println!(
            "  {}{} -> left={} right={}",
            "  ".repeat(depth - 1),
            id,
            left.map_or("-".to_string(), PeerId::to_string),
            right.map_or("-".to_string(), PeerId::to_string),
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let viewers: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 5,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("treecast=info".parse()?)
                .add_directive("overlay_sim=info".parse()?),
        )
        .init();

    let network = MemoryNetwork::new();
    let origin = network.attach(PeerId::from("origin"), 256).await;
    let (coordinator, control) = CoordinatorService::new(CoordinatorConfig::default(), origin);
    let coordinator_task = tokio::spawn(coordinator.run());
    control.set_media(Some(MediaStream::new("camera"))).await?;

    let mut handles: Vec<(PeerId, NodeHandle)> = Vec::new();
    for i in 1..=viewers {
        let id = PeerId::from(format!("viewer-{}", i));
        let transport = network.attach(id.clone(), 256).await;
        let (node, handle, mut events) =
            NodeService::new(id.clone(), NodeConfig::new("origin"), transport);
        tokio::spawn(node.run());

        let label = id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    NodeEvent::StreamChanged(Some(stream)) => {
                        println!("[{}] receiving {}", label, stream.id())
                    }
                    NodeEvent::StreamChanged(None) => println!("[{}] stream lost", label),
                    other => tracing::debug!(peer = %label, event = ?other, "Node event"),
                }
            }
        });

        handles.push((id, handle));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    print_tree(&control).await?;

    let root = control.topology().await?.root().cloned();
    if let Some(root) = root {
        println!("\n{} leaves", root);
        if let Some((_, handle)) = handles.iter().find(|(id, _)| *id == root) {
            handle.leave().await?;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        print_tree(&control).await?;
    }

    let stats = control.stats().await?;
    println!(
        "\nStats after {:?}: joins={} leaves={} stale_leaves={} assignments={} root_calls={}",
        stats.uptime(),
        stats.joins,
        stats.leaves,
        stats.stale_leaves,
        stats.assignments_sent,
        stats.root_calls
    );

    control.shutdown().await?;
    coordinator_task.await??;
    Ok(())
}
