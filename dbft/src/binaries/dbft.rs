use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use dbft::config::NodeConfig;
use dbft::logging;
use dbft::metrics::PrometheusMetrics;
use dbft::net::LocalNet;
use dbft::store::FileStore;
use dbft::{Consensus, ConsensusConfig, ConsensusMetrics, Coordinator, Event, Handle};
use dbft::{MemLedger, MemPool, MemStore};
use dbft_types::{RecoveryStore, Timestamp, Transaction};
use multisig::{Committee, Keypair};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Run a dBFT committee inside one process.
#[derive(Parser, Debug)]
struct Cli {
    /// Node configuration files, one per node.
    ///
    /// Without any, a committee of deterministic keys is generated.
    #[clap(long)]
    config: Vec<PathBuf>,

    /// Size of the generated committee.
    #[clap(long, default_value_t = 4)]
    committee_size: u8,

    /// Stop after this many blocks.
    #[clap(long, default_value_t = 10)]
    blocks: u32,

    /// Target block time of the generated committee in milliseconds.
    #[clap(long, default_value_t = 1000)]
    block_time: u64,

    /// Synthetic transactions per second.
    #[clap(long, default_value_t = 10)]
    tps: u32,

    /// Print the metrics of the first node on exit.
    #[clap(long)]
    metrics: bool,
}

struct Node {
    keypair: Keypair,
    committee: Committee,
    config: ConsensusConfig,
    store: Box<dyn RecoveryStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();

    let cli = Cli::parse();

    let nodes = if cli.config.is_empty() {
        generate(&cli)?
    } else {
        let mut nodes = Vec::new();
        for path in &cli.config {
            let cfg = NodeConfig::read(path).await?;
            nodes.push(Node {
                keypair: cfg.keypair(),
                committee: cfg.committee(),
                store: Box::new(FileStore::new(&cfg.recovery_store)),
                config: cfg.consensus,
            })
        }
        nodes
    };

    let mut net = LocalNet::new(nodes.iter().map(|n| n.keypair.public_key()));
    let genesis = Timestamp::now();
    let prometheus = PrometheusMetrics::default();

    let mut handles: Vec<Handle> = Vec::new();
    let mut pools = Vec::new();
    let mut tasks: Vec<JoinHandle<_>> = Vec::new();

    for (i, n) in nodes.into_iter().enumerate() {
        let ledger = Arc::new(MemLedger::new(genesis, n.committee.clone()));
        let pool = Arc::new(MemPool::new());
        let comm = net
            .join(n.keypair.public_key())
            .ok_or_else(|| anyhow!("duplicate node key {}", n.keypair.public_key()))?;
        let mut consensus = Consensus::new(
            n.keypair,
            n.committee,
            n.config,
            ledger.clone(),
            pool.clone(),
            n.store,
        )?;
        if i == 0 {
            consensus = consensus.with_metrics(ConsensusMetrics::new(&prometheus))
        }
        let coordinator = Coordinator::new(consensus, comm, ledger, pool.clone());
        handles.push(coordinator.handle());
        pools.push(pool);
        tasks.push(tokio::spawn(coordinator.go()));
    }

    let mut blocks = handles[0].subscribe();

    let generator = (cli.tps > 0).then(|| {
        tokio::spawn(generate_transactions(
            cli.tps,
            pools.clone(),
            handles.clone(),
        ))
    });

    loop {
        tokio::select! {
            b = blocks.recv() => match b {
                Ok(b) => {
                    info!(height = %b.height(), txs = %b.transactions().len(), "block committed");
                    if b.height().u32() >= cli.blocks {
                        break
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(%n, "missed blocks"),
                Err(RecvError::Closed) => bail!("first node stopped"),
            },
            _ = signal::ctrl_c() => {
                warn!("received ctrl-c; shutting down");
                break
            }
        }
    }

    if let Some(g) = generator {
        g.abort()
    }

    for h in &handles {
        let _ = h.shutdown().await;
    }

    for t in tasks {
        if let Err(err) = t.await? {
            warn!(%err, "node stopped with error")
        }
    }

    if cli.metrics {
        println!("{}", prometheus.export()?)
    }

    Ok(())
}

fn generate(cli: &Cli) -> Result<Vec<Node>> {
    if cli.committee_size == 0 {
        bail!("committee must not be empty")
    }
    let keys = (0..cli.committee_size)
        .map(|i| Keypair::from_seed([i.saturating_add(1); 32]))
        .collect::<Result<Vec<_>, _>>()?;
    let committee = Committee::new(keys.iter().map(|k| k.public_key()));
    let config = ConsensusConfig::default().with_block_time(Duration::from_millis(cli.block_time));
    Ok(keys
        .into_iter()
        .map(|k| Node {
            keypair: k,
            committee: committee.clone(),
            config: config.clone(),
            store: Box::new(MemStore::new()),
        })
        .collect())
}

async fn generate_transactions(tps: u32, pools: Vec<Arc<MemPool>>, handles: Vec<Handle>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1) / tps);
    let mut nonce = 0;
    loop {
        interval.tick().await;
        nonce += 1;
        let data = rand::random::<[u8; 32]>();
        let tx = Transaction::new(nonce, 0, rand::random_range(1..1000), data.to_vec());
        for p in &pools {
            p.add_verified(tx.clone())
        }
        for h in &handles {
            if h.send(Event::MempoolArrival(tx.clone())).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, generate};

    #[test]
    fn generated_committee_has_distinct_members() {
        let cli = Cli::parse_from(["dbft", "--committee-size", "4"]);
        let nodes = generate(&cli).unwrap();
        assert_eq!(nodes.len(), 4);
        for (i, n) in nodes.iter().enumerate() {
            assert_eq!(n.committee.size().get(), 4);
            let k = n.committee.get_index(&n.keypair.public_key()).unwrap();
            assert_eq!(usize::from(k), i);
        }
    }

    #[test]
    fn empty_committee_is_rejected() {
        let cli = Cli::parse_from(["dbft", "--committee-size", "0"]);
        assert!(generate(&cli).is_err());
    }
}
