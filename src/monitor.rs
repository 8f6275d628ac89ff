//! The resource monitor: a loopback RPC server the language runtime calls
//! into while the user program executes.
//!
//! `Invoke` is a synchronous side-channel straight to the provider. The two
//! registration RPCs each push an event onto the iterator's channel and
//! then park until the engine completes the event, which is what holds the
//! program in rendezvous with the engine. Every suspension point also
//! watches the cancel flag so teardown can unblock parked calls instead of
//! stranding them.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::messages::proto;
use crate::messages::proto::resource_monitor_server::{ResourceMonitor, ResourceMonitorServer};
use crate::plugin::Host;
use crate::property::{marshal_properties, unmarshal_properties, MarshalOptions};
use crate::resource::{FinalState, Goal};
use crate::source::{BeginRegisterEvent, EndRegisterEvent, SourceError};
use crate::tokens::{FunctionToken, ResourceType, Urn};

/// Options for registration payloads arriving from the program.
const REGISTER_OPTS: MarshalOptions = MarshalOptions {
    keep_unknowns: true,
    compute_asset_hashes: true,
};

/// Options for everything else crossing the wire.
const KEEP_UNKNOWNS: MarshalOptions = MarshalOptions {
    keep_unknowns: true,
    compute_asset_hashes: false,
};

/// Handle on a running resource monitor server.
pub struct Monitor {
    addr: SocketAddr,
    cancel: watch::Sender<bool>,
    server: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
}

impl Monitor {
    /// Bind an ephemeral loopback port and start serving.
    pub(crate) async fn start(
        host: Arc<dyn Host>,
        begin_tx: mpsc::Sender<BeginRegisterEvent>,
        end_tx: mpsc::Sender<EndRegisterEvent>,
    ) -> Result<Self, SourceError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(SourceError::MonitorStart)?;
        let addr = listener.local_addr().map_err(SourceError::MonitorStart)?;

        let (cancel, cancel_rx) = watch::channel(false);
        let service = MonitorService {
            host,
            begin_tx,
            end_tx,
            cancel: cancel_rx.clone(),
        };

        let mut shutdown_rx = cancel_rx;
        let server = tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            Server::builder()
                .add_service(ResourceMonitorServer::new(service))
                .serve_with_incoming_shutdown(incoming, shutdown)
                .await
        });

        info!(%addr, "resource monitor listening");
        Ok(Self {
            addr,
            cancel,
            server: Some(server),
        })
    }

    /// The address handed to the language runtime on startup.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Stop accepting RPCs, unblock any parked registrations, and await
    /// server teardown.
    pub async fn cancel(&mut self) -> Result<(), SourceError> {
        let _ = self.cancel.send(true);
        if let Some(server) = self.server.take() {
            match server.await {
                Ok(result) => result.map_err(SourceError::MonitorServe)?,
                Err(err) => return Err(SourceError::MonitorPanic(err)),
            }
        }
        Ok(())
    }
}

struct MonitorService {
    host: Arc<dyn Host>,
    begin_tx: mpsc::Sender<BeginRegisterEvent>,
    end_tx: mpsc::Sender<EndRegisterEvent>,
    cancel: watch::Receiver<bool>,
}

impl MonitorService {
    /// Drive `fut` to completion unless the monitor is cancelled first.
    async fn unless_cancelled<T>(&self, fut: impl Future<Output = T>) -> Result<T, Status> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            out = fut => Ok(out),
            _ = cancel.wait_for(|stop| *stop) => {
                Err(Status::cancelled("resource monitor is shutting down"))
            }
        }
    }
}

#[tonic::async_trait]
impl ResourceMonitor for MonitorService {
    async fn invoke(
        &self,
        request: Request<proto::InvokeRequest>,
    ) -> Result<Response<proto::InvokeResponse>, Status> {
        let req = request.into_inner();
        let tok = FunctionToken::from(req.tok);
        let package = tok.package();

        let provider = self
            .host
            .provider(&package)
            .await
            .map_err(|err| {
                Status::internal(format!(
                    "failed to load resource provider for package '{package}': {err:#}"
                ))
            })?
            .ok_or_else(|| {
                Status::not_found(format!(
                    "could not load resource provider for package '{package}'"
                ))
            })?;

        let args = unmarshal_properties(&req.args.unwrap_or_default(), KEEP_UNKNOWNS)
            .map_err(|err| Status::invalid_argument(format!("failed to unmarshal {tok} args: {err}")))?;

        debug!(tok = %tok, args = args.len(), "invoke received");
        let outcome = provider
            .invoke(&tok, args)
            .await
            .map_err(|err| Status::internal(format!("invocation of {tok} returned an error: {err:#}")))?;

        let ret = marshal_properties(&outcome.returns, KEEP_UNKNOWNS)
            .map_err(|err| Status::internal(format!("failed to marshal {tok} return: {err}")))?;
        let failures = outcome.failures.into_iter().map(Into::into).collect();

        Ok(Response::new(proto::InvokeResponse {
            r#return: Some(ret),
            failures,
        }))
    }

    async fn begin_register_resource(
        &self,
        request: Request<proto::BeginRegisterResourceRequest>,
    ) -> Result<Response<proto::BeginRegisterResourceResponse>, Status> {
        let req = request.into_inner();
        let props = unmarshal_properties(&req.object.unwrap_or_default(), REGISTER_OPTS)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;

        let ty = ResourceType::from(req.r#type);
        let name = req.name;
        let custom = req.custom;
        let parent = if req.parent.is_empty() {
            None
        } else {
            Some(Urn::from(req.parent))
        };
        debug!(
            ty = %ty,
            name = %name,
            custom,
            props = props.len(),
            parent = ?parent,
            "begin-register received"
        );

        let goal = Goal::new(ty.clone(), name.clone(), custom, props, parent);
        let (event, reply) = BeginRegisterEvent::new(goal);

        self.unless_cancelled(self.begin_tx.send(event))
            .await?
            .map_err(|_| Status::unavailable("event stream is closed"))?;

        // Parked until the engine assigns a URN.
        let urn = self
            .unless_cancelled(reply)
            .await?
            .map_err(|_| Status::unavailable("registration abandoned before a URN was assigned"))?;

        debug!(ty = %ty, name = %name, urn = %urn, "begin-register finished");
        Ok(Response::new(proto::BeginRegisterResourceResponse {
            urn: urn.into_string(),
        }))
    }

    async fn end_register_resource(
        &self,
        request: Request<proto::EndRegisterResourceRequest>,
    ) -> Result<Response<proto::EndRegisterResourceResponse>, Status> {
        let req = request.into_inner();
        if req.urn.is_empty() {
            return Err(Status::invalid_argument("missing required URN"));
        }
        let urn = Urn::from(req.urn);
        let extras = unmarshal_properties(&req.extras.unwrap_or_default(), REGISTER_OPTS)
            .map_err(|err| {
                Status::invalid_argument(format!("cannot unmarshal output properties: {err}"))
            })?;
        debug!(urn = %urn, extras = extras.len(), "end-register received");

        let (event, reply) = EndRegisterEvent::new(urn.clone(), extras);

        self.unless_cancelled(self.end_tx.send(event))
            .await?
            .map_err(|_| Status::unavailable("event stream is closed"))?;

        // Parked until the engine finishes its step for this resource.
        let FinalState {
            state,
            stable,
            stables,
        } = self
            .unless_cancelled(reply)
            .await?
            .map_err(|_| Status::unavailable("completion abandoned before final state arrived"))?;

        let outs = state.synthesized();
        debug!(
            urn = %urn,
            id = %state.id,
            stable,
            stables = stables.len(),
            outs = outs.len(),
            "end-register finished"
        );
        let object = marshal_properties(&outs, KEEP_UNKNOWNS)
            .map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(proto::EndRegisterResourceResponse {
            id: state.id,
            object: Some(object),
            stable,
            stables,
        }))
    }
}
