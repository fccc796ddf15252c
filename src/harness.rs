use async_std::channel;
use async_std::sync::{Arc, Mutex};
use axum::Router;
use axum_tonic::{NestTonic, RestGrpcService};
use futures::Future;
use futures::future::join_all;
use std::env;
use std::error::Error;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};

use crate::keyvalue::grpc::{ClusterServer, KeyValueServer};
use crate::keyvalue::{HttpHandler, KeyValueService, KeyValueStateMachine, MapStore};
use crate::raft::raft_common_proto::{ClusterConfig, Member};
use crate::raft::raft_service_proto::raft_server::RaftServer;
use crate::raft::{Client, Diagnostics, FailureOptions, Options, RaftImpl, Role, ServerDiagnostics};

#[cfg(test)]
use {
    crate::keyvalue::grpc::{ClusterClient, GetRequest, KeyValueClient},
    crate::raft::SnapshotInfo,
    bytes::Bytes,
    tonic::transport::Channel,
};

// Number of instances which make up the initial set of voters. Any further
// instances have to be joined explicitly.
const INITIAL_VOTERS: usize = 3;

const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(3);

// Represents a collection of participants that interact with each other. In a real
// production deployment, these participants might be on different actual machines,
// but the harness manages all of them in a single process for convenience.
pub struct Harness {
    instances: Vec<Instance>,
    diagnostics: Arc<Mutex<Diagnostics>>,
    failures: Arc<Mutex<FailureOptions>>,
}

// Used to capture the intermediate state while building a harness. This is necessary
// because we first need to bind a port for each instance, then collect all the port
// addresses, and then start the underlying services (which require knowledge of the
// ports for the other participants).
pub struct HarnessBuilder {
    cluster_name: String,
    bound: Vec<BoundAddress>,
    failure: FailureOptions,
    options: Options,
    persistence: Option<bool>,
    commit_timeout: Duration,
}

impl HarnessBuilder {
    // Returns a harness instance, as well a future that callers can wait on for the termination
    // of the serving process for all instances managed by the harness.
    pub async fn build(
        self,
    ) -> Result<(Harness, Pin<Box<dyn Future<Output = ()> + Send>>), Box<dyn Error>> {
        let diag = Arc::new(Mutex::new(Diagnostics::new()));
        let failures = Arc::new(Mutex::new(self.failure.clone()));
        let all = self.addresses();
        let config = ClusterConfig {
            voters: all.iter().take(INITIAL_VOTERS).cloned().collect(),
        };

        let mut serving = Vec::new();
        let mut instances = Vec::new();
        for bound in self.bound {
            let (address, listener) = (bound.member, bound.listener);

            // Use something like /tmp/raftkv/<cluster>/<member> for persistence.
            let options = match self.persistence {
                None => self.options.clone(),
                Some(wipe) => {
                    let path = env::temp_dir()
                        .join("raftkv")
                        .join(&self.cluster_name)
                        .join(&address.id);
                    let path = path.to_str().ok_or("Non-utf8 temp directory")?;
                    self.options.clone().with_persistence(path, wipe)
                }
            };

            let server_diagnostics = diag.lock().await.get_server(&address);
            let (instance, future) = Instance::new(
                &address,
                listener,
                config.clone(),
                Some(server_diagnostics),
                options,
                failures.clone(),
                self.commit_timeout,
            )
            .await?;
            let span = info_span!("serve", server = %address.id);

            instances.push(instance);
            serving.push(future.instrument(span));
        }

        let future = Box::pin(async {
            join_all(serving).await;
        });
        let harness = Harness {
            instances,
            diagnostics: diag,
            failures,
        };
        Ok((harness, future))
    }

    // Consumes this instance and returns an instance with the failure options set.
    pub fn with_failure(self, failure: FailureOptions) -> Self {
        Self { failure, ..self }
    }

    // Consumes this instance and returns an instance with the raft options set.
    pub fn with_options(self, options: Options) -> Self {
        Self { options, ..self }
    }

    // Makes every instance keep its state in a directory under the system's
    // temp directory, optionally wiping what a previous run left behind.
    pub fn with_persistence(self, wipe: bool) -> Self {
        Self {
            persistence: Some(wipe),
            ..self
        }
    }

    pub fn with_commit_timeout(self, commit_timeout: Duration) -> Self {
        Self {
            commit_timeout,
            ..self
        }
    }

    // Returns the addresses of all bound ports in this builder.
    pub fn addresses(&self) -> Vec<Member> {
        self.bound.iter().map(|b| b.member.clone()).collect()
    }
}

impl Harness {
    // Creates a harness builder. This will immediately bind an incoming port for
    // each supplied instance name.
    pub async fn builder(
        cluster_name: &str,
        names: &[&str],
    ) -> Result<HarnessBuilder, Box<dyn Error>> {
        let mut bound = Vec::new();
        for name in names {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let member = Member {
                id: name.to_string(),
                address: listener.local_addr()?.to_string(),
            };
            bound.push(BoundAddress { listener, member })
        }
        Ok(HarnessBuilder {
            cluster_name: cluster_name.to_string(),
            bound,
            failure: FailureOptions::no_failures(),
            options: Options::new_without_persistence_for_testing(),
            persistence: None,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        })
    }

    // Returns all the addresses managed by this harness. Note that this can include
    // members that are not currently part of the cluster.
    pub fn addresses(&self) -> Vec<Member> {
        self.instances.iter().map(|i| i.address.clone()).collect()
    }

    // Returns the diagnostics object used for this harness.
    pub fn diagnostics(&self) -> Arc<Mutex<Diagnostics>> {
        self.diagnostics.clone()
    }

    // Returns the failure options object used for this harness.
    #[cfg(test)]
    pub fn failures(&self) -> Arc<Mutex<FailureOptions>> {
        self.failures.clone()
    }

    // Returns the raft participant of the supplied member.
    pub fn raft(&self, id: &str) -> Option<Arc<RaftImpl>> {
        self.instance(id).map(|i| i.raft.clone())
    }

    // Returns a client that can be used to issue keyvalue operations against
    // the supplied member.
    #[cfg(test)]
    pub async fn make_kv_client(&self, id: &str) -> Result<KeyValueClient<Channel>, Box<dyn Error>> {
        let address = self.address_of(id)?;
        Ok(KeyValueClient::connect(format!("http://{}", address)).await?)
    }

    // Returns a client that can be used to manage the cluster through the
    // supplied member.
    #[cfg(test)]
    pub async fn make_cluster_client(
        &self,
        id: &str,
    ) -> Result<ClusterClient<Channel>, Box<dyn Error>> {
        let address = self.address_of(id)?;
        Ok(ClusterClient::connect(format!("http://{}", address)).await?)
    }

    // Validates all available diagnostics and panics on failure.
    #[cfg(test)]
    pub async fn validate(&self) {
        self.diagnostics
            .lock()
            .await
            .validate()
            .await
            .expect("validate");
    }

    // Starts the logic for this harness.
    pub async fn start(&self) {
        for instance in &self.instances {
            instance.start().await;
        }
    }

    // Stops all the instances of this harness.
    pub async fn stop(&self) {
        for instance in &self.instances {
            instance.stop().await;
        }
    }

    // Waits for a leader matching the supplied predicate to show up among the
    // participants which are currently able to talk to a majority.
    pub async fn wait_for_leader<M>(
        &self,
        timeout_duration: Duration,
        matcher: M,
    ) -> Result<(i64, Member), Box<dyn Error>>
    where
        M: Fn(&(i64, Member)) -> bool,
    {
        wait_for(timeout_duration, || async {
            let (term, leader) = self.diagnostics.lock().await.latest_leader().await?;
            let raft = self.raft(&leader.id)?;

            // The diagnostics may still remember a leader which has since
            // stepped down.
            let status = raft.status().await;
            if status.role != Role::Leader || status.term != term {
                return None;
            }
            if self.failures.lock().await.disconnected.contains(&leader.id) {
                return None;
            }
            let candidate = (term, leader);
            matcher(&candidate).then_some(candidate)
        })
        .await
        .map_err(|_| "Timed out waiting for a leader".into())
    }

    // Repeatedly reads the supplied key from the supplied member until the
    // predicate holds for the value (None if absent). Returns the value.
    #[cfg(test)]
    pub async fn wait_for_value<M>(
        &self,
        id: &str,
        key: &[u8],
        timeout_duration: Duration,
        matcher: M,
    ) -> Option<Bytes>
    where
        M: Fn(&Option<Bytes>) -> bool,
    {
        wait_for(timeout_duration, || async {
            let mut client = self.make_kv_client(id).await.ok()?;
            let value = match client.get(GetRequest { key: key.to_vec() }).await {
                Ok(response) => Some(Bytes::from(response.into_inner().value)),
                Err(status) if status.code() == tonic::Code::NotFound => None,
                Err(_) => return None,
            };
            matcher(&value).then_some(value)
        })
        .await
        .expect("wait_for_value")
    }

    // Waits for the supplied member to install a snapshot sent by a leader.
    #[cfg(test)]
    pub async fn wait_for_snapshot(&self, id: &str, timeout_duration: Duration) -> SnapshotInfo {
        let diag = self.diagnostics.clone();
        wait_for(timeout_duration, || async {
            let installs = diag.lock().await.get_snapshot_installs(id).await?;
            installs.first().cloned()
        })
        .await
        .expect("wait_for_snapshot")
    }

    fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.address.id == id)
    }

    #[cfg(test)]
    fn address_of(&self, id: &str) -> Result<String, Box<dyn Error>> {
        match self.instance(id) {
            Some(instance) => Ok(instance.address.address.clone()),
            None => Err(format!("Unknown member: {}", id).into()),
        }
    }
}

// Holds the state of a single server instance, listening on a port. This includes multiple
// grpc and http services multiplexed on the port.
pub struct Instance {
    address: Member,
    raft: Arc<RaftImpl>,
    shutdown: channel::Sender<()>,
}

impl Instance {
    // Creates a new server with the supplied listener. This just initializes all the
    // required objects. Callers still need to call start() on this instance once done.
    // The returned future completes once the server finishes serving.
    pub async fn new(
        address: &Member,
        listener: TcpListener,
        initial_config: ClusterConfig,
        diagnostics: Option<Arc<Mutex<ServerDiagnostics>>>,
        raft_options: Options,
        failure_options: Arc<Mutex<FailureOptions>>,
        commit_timeout: Duration,
    ) -> Result<(Self, Pin<Box<dyn Future<Output = ()> + Send>>), Box<dyn Error>> {
        let name = address.id.clone();
        let max_message_bytes = raft_options.max_message_bytes();
        let port = listener.local_addr()?.port().to_string();
        if address.address.rsplit(':').next() != Some(port.as_str()) {
            return Err(format!(
                "Listener port {} must match member address {}",
                port, address.address
            )
            .into());
        }

        // The raft participant is the one applying the writes to the store,
        // the services only ever read from it.
        let store = Arc::new(MapStore::new());
        let state_machine = Arc::new(Mutex::new(KeyValueStateMachine::new(store.clone())));
        let raft = Arc::new(
            RaftImpl::new(
                address,
                initial_config,
                state_machine,
                diagnostics,
                raft_options,
                failure_options,
            )
            .await
            .map_err(|e| format!("Failed to create raft participant '{}': {}", name, e))?,
        );

        // Set up the keyvalue services, along with the web and grpc serving objects.
        let kv_service = Arc::new(KeyValueService::new(
            name.as_str(),
            store,
            raft.clone(),
            commit_timeout,
        ));
        let web: Router = HttpHandler::new(kv_service.clone()).routes();
        let grpc = Router::new()
            .nest_tonic(
                RaftServer::from_arc(raft.clone())
                    .max_decoding_message_size(max_message_bytes)
                    .max_encoding_message_size(max_message_bytes),
            )
            .nest_tonic(KeyValueServer::from_arc(kv_service.clone()))
            .nest_tonic(ClusterServer::from_arc(kv_service));
        let rest_grpc = RestGrpcService::new(web, grpc).into_make_service();

        // Wire up the shutdown.
        let (sender, receiver) = channel::unbounded::<()>();
        let signal = async move { receiver.recv().await.unwrap_or(()) };

        let serving_future = Box::pin(async move {
            match axum::serve(listener, rest_grpc)
                .with_graceful_shutdown(signal)
                .await
            {
                Ok(()) => info!("Serving terminated"),
                Err(message) => error!("Serving terminated unsuccessfully: {}", message),
            }
        });

        info!(
            "Started http and grpc server [id={}]. Open at http://{}/v1/cluster",
            address.id, address.address
        );
        let result = Instance {
            address: address.clone(),
            raft,
            shutdown: sender,
        };
        Ok((result, serving_future))
    }

    // Starts the background logic in service implementations (e.g., raft election loop).
    pub async fn start(&self) {
        self.raft.start().await;
    }

    // Stops the participant and sends the signal to shut down the server.
    pub async fn stop(&self) {
        self.raft.halt("Shutting down").await;
        self.shutdown.send(()).await.ok();
    }
}

struct BoundAddress {
    member: Member,
    listener: TcpListener,
}

// Waits for a condition to produce a value, up to the given timeout. Returns
// Err(()) if the condition did not produce a value in time.
async fn wait_for<F, Fut, T>(timeout_duration: Duration, mut condition: F) -> Result<T, ()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if let Some(result) = condition().await {
            return Ok(result);
        }
        sleep(Duration::from_millis(100)).await;
    }
    Err(())
}
