//! A module for the connection worker.
//!
//! Each connection owns one worker thread that runs driver requests one at a
//! time, in submission order, and answers each with exactly one
//! [`Response`].
use std::{
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread,
};

use crossbeam_channel::{Receiver, Sender};

use crate::driver::{Driver, DriverContext, InterruptFlag};
use crate::error::{BridgeError, Result};
use crate::protocol::{Inbound, Reply, Request, RequestKind, Response};

/// A message is a message that can be sent to a worker.
pub(crate) enum Message {
    /// A request to serve.
    NewJob(Request),
    /// A terminate message to tell the worker to terminate.
    Terminate,
}

/// The thread serving one connection's driver.
pub(crate) struct Worker {
    name: String,
    sender: Sender<Message>,
    interrupt: InterruptFlag,
    stopping: InterruptFlag,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread. Responses and notices go to `inbound`.
    pub(crate) fn spawn<D: Driver>(
        name: &str,
        driver: Arc<D>,
        inbound: Sender<Inbound>,
    ) -> Result<Self> {
        if name.contains('\0') {
            return Err(BridgeError::IOError(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker thread name contains a nul byte",
            )));
        }
        let (sender, receiver) = crossbeam_channel::unbounded();
        let interrupt = InterruptFlag::new();
        let stopping = InterruptFlag::new();
        let thread = {
            let interrupt = interrupt.clone();
            let stopping = stopping.clone();
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || run(driver, receiver, inbound, interrupt, stopping))?
        };
        Ok(Self {
            name: name.to_string(),
            sender,
            interrupt,
            stopping,
            thread: Some(thread),
        })
    }

    /// Queue a request behind the ones already submitted.
    pub(crate) fn submit(&self, request: Request) -> Result<()> {
        self.sender
            .send(Message::NewJob(request))
            .map_err(|_| BridgeError::WorkerGone)
    }

    /// Interrupt the running job, if any.
    pub(crate) fn interrupt(&self) {
        self.interrupt.raise();
    }

    /// Stop the thread. Jobs still queued are answered with `Interrupted`
    /// without reaching the driver.
    pub(crate) fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stopping.raise();
        self.interrupt.raise();
        // a send error means the thread already left its loop
        let _ = self.sender.send(Message::Terminate);
        if let Err(e) = thread.join() {
            log::error!("worker {} join failed: {:?}", self.name, e);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<D: Driver>(
    driver: Arc<D>,
    receiver: Receiver<Message>,
    inbound: Sender<Inbound>,
    interrupt: InterruptFlag,
    stopping: InterruptFlag,
) {
    loop {
        let request = match receiver.recv() {
            Ok(Message::NewJob(request)) => request,
            Ok(Message::Terminate) | Err(_) => break,
        };
        let result = if stopping.is_raised() {
            Err(BridgeError::Interrupted)
        } else {
            interrupt.clear();
            // shutdown may have raised both flags between the check and the clear
            if stopping.is_raised() {
                interrupt.raise();
            }
            log::debug!("running request {:?}", request.id);
            let ctx = DriverContext::new(request.id, inbound.clone(), interrupt.clone());
            match catch_unwind(AssertUnwindSafe(|| {
                execute_request(driver.as_ref(), &request.kind, &ctx)
            })) {
                Ok(result) => result,
                Err(e) => {
                    let message = panic_message(e.as_ref());
                    log::warn!("request {:?} panicked: {message}", request.id);
                    Err(BridgeError::Panicked(message))
                }
            }
        };
        let response = Response {
            id: request.id,
            result: result.map_err(Into::into),
        };
        if inbound.send(Inbound::Response(response)).is_err() {
            break;
        }
    }
}

fn execute_request<D: Driver>(
    driver: &D,
    kind: &RequestKind,
    ctx: &DriverContext,
) -> Result<Reply> {
    match kind {
        RequestKind::Connect => driver.connect(ctx).map(|_| Reply::Connected),
        RequestKind::Disconnect => driver.disconnect(ctx).map(|_| Reply::Disconnected),
        RequestKind::LoadDatabases => driver.load_databases(ctx).map(Reply::Databases),
        RequestKind::LoadDatabaseContent(req) => driver
            .load_database_content(req, ctx)
            .map(Reply::DatabaseContent),
        RequestKind::Execute(req) => driver.execute(req, ctx).map(Reply::Executed),
        RequestKind::ShutDown => driver.shutdown(ctx).map(|_| Reply::ShutDown),
        RequestKind::Backup { path } => driver
            .backup(path, ctx)
            .map(|_| Reply::BackedUp(path.clone())),
        RequestKind::Export { path } => driver
            .export(path, ctx)
            .map(|_| Reply::Exported(path.clone())),
        RequestKind::ChangePassword {
            old_password,
            new_password,
        } => driver
            .change_password(old_password, new_password, ctx)
            .map(|_| Reply::PasswordChanged),
        RequestKind::SetMaxConnection { max_connections } => driver
            .set_max_connection(*max_connections, ctx)
            .map(Reply::MaxConnectionChanged),
        RequestKind::LoadServerInfo => driver.load_server_info(ctx).map(Reply::ServerInfo),
        RequestKind::LoadServerProperties => driver
            .load_server_properties(ctx)
            .map(Reply::ServerProperties),
        RequestKind::ChangeServerProperty(property) => driver
            .change_server_property(property, ctx)
            .map(|changed| Reply::ServerPropertyChanged {
                property: property.clone(),
                changed,
            }),
        RequestKind::LoadServerHistory => {
            driver.load_server_history(ctx).map(Reply::ServerHistory)
        }
        RequestKind::ClearHistory => driver.clear_history(ctx).map(|_| Reply::HistoryCleared),
        RequestKind::LoadChannels { pattern } => {
            driver.load_channels(pattern, ctx).map(Reply::Channels)
        }
        RequestKind::DiscoveryInfo => driver
            .discovery_info(ctx)
            .map(|(info, database)| Reply::Discovery { info, database }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
