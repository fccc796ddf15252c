extern crate structopt;
extern crate tracing;

use async_std::sync::{Arc, Mutex};
use futures::FutureExt;
use std::error::Error;
use std::time::Duration;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tokio::select;
use tokio::time::sleep;
use tonic::transport::Channel;
use tracing::{Instrument, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::harness::{Harness, Instance};
use crate::keyvalue::grpc::{
    ClusterClient, DeleteRequest, GetRequest, JoinRequest, KeyValueClient, LeaveRequest,
    SetRequest, StatusRequest,
};
use crate::raft::raft_common_proto::{ClusterConfig, Member};
use crate::raft::{Diagnostics, FailureOptions, Options};

mod harness;
#[cfg(test)]
mod integration_test;
mod keyvalue;
mod raft;

const CLUSTER_NAME: &str = "dev-cluster";

// Failures injected into the local dev cluster when requested.
fn make_default_failure_options() -> FailureOptions {
    FailureOptions {
        latency_probability: 0.05,
        latency_ms: 50,
        ..FailureOptions::fail_with_probability(0.01)
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "raftkv", about = "A replicated key-value store")]
enum Arguments {
    /// Runs a single node of a cluster.
    Start {
        /// Stable identifier of this node within the cluster.
        #[structopt(long = "id")]
        id: String,

        /// Address to serve grpc and http traffic on, e.g., 127.0.0.1:8080.
        #[structopt(long = "address")]
        address: String,

        /// Directory holding the node's persistent state.
        #[structopt(long = "data-dir", default_value = "data")]
        data_dir: String,

        /// Starts a new cluster with this node as its only member.
        #[structopt(long = "bootstrap")]
        bootstrap: bool,

        /// Discards any state left in the data directory.
        #[structopt(long = "wipe")]
        wipe: bool,

        #[structopt(long = "commit-timeout-ms", default_value = "3000")]
        commit_timeout_ms: u64,

        /// Log size after which the node compacts its log into a snapshot.
        #[structopt(long = "compaction-bytes")]
        compaction_bytes: Option<i64>,

        /// Largest message exchanged with peers, which bounds the snapshot size.
        #[structopt(long = "max-message-bytes")]
        max_message_bytes: Option<usize>,
    },

    /// Runs a cluster of several nodes within this process.
    Local {
        #[structopt(long = "nodes", default_value = "3")]
        nodes: usize,

        #[structopt(short = "w", long = "wipe")]
        wipe: bool,

        /// Makes peer rpcs occasionally fail or slow down.
        #[structopt(short = "f", long = "inject-failures")]
        inject_failures: bool,

        /// Skips the periodic validation of the cluster's leader history.
        #[structopt(short = "v", long = "disable-validate")]
        disable_validate: bool,

        #[structopt(long = "commit-timeout-ms", default_value = "3000")]
        commit_timeout_ms: u64,
    },

    /// Prints the cluster status as seen by a node.
    Status {
        #[structopt(long = "server", default_value = "127.0.0.1:8080")]
        server: String,
    },

    /// Adds a node to the cluster. Must be sent to the leader.
    Join {
        #[structopt(long = "server", default_value = "127.0.0.1:8080")]
        server: String,
        id: String,
        address: String,
    },

    /// Removes a node from the cluster. Must be sent to the leader.
    Leave {
        #[structopt(long = "server", default_value = "127.0.0.1:8080")]
        server: String,
        id: String,
    },

    Get {
        #[structopt(long = "server", default_value = "127.0.0.1:8080")]
        server: String,
        key: String,
    },

    Set {
        #[structopt(long = "server", default_value = "127.0.0.1:8080")]
        server: String,
        key: String,
        value: String,
    },

    Delete {
        #[structopt(long = "server", default_value = "127.0.0.1:8080")]
        server: String,
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // This allows configuring the filters using the RUST_LOG env variable.
    // Example:
    // > RUST_LOG=info,raftkv::keyvalue=debug cargo run -- local
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::from("raftkv=info"));

    tracing_subscriber::FmtSubscriber::builder()
        .with_target(false)
        .with_env_filter(env_filter)
        .init();

    match Arguments::from_args() {
        Arguments::Start {
            id,
            address,
            data_dir,
            bootstrap,
            wipe,
            commit_timeout_ms,
            compaction_bytes,
            max_message_bytes,
        } => {
            let mut options = Options::default().with_persistence(&data_dir, wipe);
            if let Some(bytes) = compaction_bytes {
                options = options.with_compaction(bytes);
            }
            if let Some(bytes) = max_message_bytes {
                options = options.with_max_message_bytes(bytes);
            }
            let member = Member { id, address };
            run_node(
                member,
                bootstrap,
                options,
                Duration::from_millis(commit_timeout_ms),
            )
            .instrument(info_span!("node"))
            .await
        }
        Arguments::Local {
            nodes,
            wipe,
            inject_failures,
            disable_validate,
            commit_timeout_ms,
        } => {
            let commit_timeout = Duration::from_millis(commit_timeout_ms);
            run_local(nodes, wipe, inject_failures, disable_validate, commit_timeout).await
        }
        Arguments::Status { server } => {
            let status = cluster_client(&server)
                .await?
                .status(StatusRequest {})
                .await?
                .into_inner();
            match &status.leader {
                Some(leader) => println!("leader: {} ({})", leader.id, leader.address),
                None => println!("leader: unknown"),
            }
            println!("role: {}, term: {}", status.role, status.term);
            for peer in status.peers {
                println!("peer: {} ({})", peer.id, peer.address);
            }
            Ok(())
        }
        Arguments::Join {
            server,
            id,
            address,
        } => {
            cluster_client(&server)
                .await?
                .join(JoinRequest { id, address })
                .await?;
            println!("joined");
            Ok(())
        }
        Arguments::Leave { server, id } => {
            cluster_client(&server)
                .await?
                .leave(LeaveRequest { id })
                .await?;
            println!("left");
            Ok(())
        }
        Arguments::Get { server, key } => {
            let response = kv_client(&server)
                .await?
                .get(GetRequest {
                    key: key.into_bytes(),
                })
                .await?
                .into_inner();
            println!("{}", String::from_utf8_lossy(&response.value));
            Ok(())
        }
        Arguments::Set { server, key, value } => {
            kv_client(&server)
                .await?
                .set(SetRequest {
                    key: key.into_bytes(),
                    value: value.into_bytes(),
                })
                .await?;
            println!("ok");
            Ok(())
        }
        Arguments::Delete { server, key } => {
            kv_client(&server)
                .await?
                .delete(DeleteRequest {
                    key: key.into_bytes(),
                })
                .await?;
            println!("ok");
            Ok(())
        }
    }
}

// Serves a single node until interrupted. A bootstrapping node starts out as
// the only member of a new cluster, everyone else waits to be joined.
// Previously persisted state takes precedence over either.
async fn run_node(
    member: Member,
    bootstrap: bool,
    options: Options,
    commit_timeout: Duration,
) -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(&member.address).await?;
    let config = if bootstrap {
        ClusterConfig {
            voters: vec![member.clone()],
        }
    } else {
        ClusterConfig::default()
    };

    let (instance, serving) = Instance::new(
        &member,
        listener,
        config,
        None,
        options,
        Arc::new(Mutex::new(FailureOptions::no_failures())),
        commit_timeout,
    )
    .await?;
    instance.start().await;

    let serving = serving.shared();
    select! {
        _ = serving.clone() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Got SIGINT, shutting down");
            instance.stop().await;
            serving.await;
        }
    }
    Ok(())
}

async fn run_local(
    nodes: usize,
    wipe: bool,
    inject_failures: bool,
    disable_validate: bool,
    commit_timeout: Duration,
) -> Result<(), Box<dyn Error>> {
    let owned: Vec<String> = (0..nodes)
        .map(|i| ((b'A' + (i % 26) as u8) as char).to_string())
        .collect();
    let names: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();

    let mut builder = Harness::builder(CLUSTER_NAME, &names)
        .await?
        .with_persistence(wipe)
        .with_commit_timeout(commit_timeout);
    if inject_failures {
        builder = builder.with_failure(make_default_failure_options());
    }
    let (harness, serving) = builder.build().await?;
    harness.start().await;
    for member in harness.addresses() {
        info!("Member {} serving at http://{}", member.id, member.address);
    }

    match harness
        .wait_for_leader(Duration::from_secs(30), |_| true)
        .await
    {
        Ok((term, leader)) => info!(term, leader = %leader.id, "Cluster elected a leader"),
        Err(e) => warn!("{}", e),
    }

    // Set up a shutdown broadcast by turning the channel receiver into a shared future.
    let (shutdown, rx) = async_std::channel::unbounded::<()>();
    let sx = async move { rx.recv().await.unwrap_or(()) }.shared();
    let validate = run_validate_loop(disable_validate, harness.diagnostics(), sx)
        .instrument(info_span!("validate"));
    let validating = tokio::spawn(validate);

    tokio::signal::ctrl_c().await?;
    info!("Got SIGINT, shutting down");
    shutdown.send(()).await.ok();
    validating.await?;
    harness.stop().await;
    serving.await;
    info!("All done, exiting");
    Ok(())
}

// Starts a loop which periodically asks the diagnostics object to validate the
// execution history of the cluster. If this fails, this indicates a bug in the
// raft implementation.
async fn run_validate_loop(
    disabled: bool,
    diag: Arc<Mutex<Diagnostics>>,
    shutdown: impl Future<Output = ()> + Clone,
) {
    if disabled {
        info!("running without the validate loop");
        return;
    }

    loop {
        let body = async {
            if let Err(message) = diag.lock().await.validate().await {
                panic!("Cluster execution validation failed: {}", message);
            }
            sleep(Duration::from_secs(5)).await;
        };

        select! {
          _ = shutdown.clone() => {break;}
          _ = body => {}
        }
    }
    info!("Finished");
}

async fn kv_client(server: &str) -> Result<KeyValueClient<Channel>, Box<dyn Error>> {
    Ok(KeyValueClient::connect(format!("http://{}", server)).await?)
}

async fn cluster_client(server: &str) -> Result<ClusterClient<Channel>, Box<dyn Error>> {
    Ok(ClusterClient::connect(format!("http://{}", server)).await?)
}
