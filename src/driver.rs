//! A module for drivers.
//!
//! A [`Driver`] runs blocking backend operations on the connection's worker
//! thread. Each request method returns exactly one result; everything the
//! driver learns about keys on the way is reported through the
//! [`DriverContext`].

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Sender;
use crossbeam_utils::atomic::AtomicCell;

use crate::error::{BridgeError, Result};
use crate::mirror::DatabaseMirror;
use crate::protocol::{
    CommandOutput, DatabaseContent, ExecuteRequest, Inbound, LoadContentRequest, Notice,
    RequestId,
};
use crate::translator::Translator;
use crate::types::{
    Channel, ConnectionPath, ConnectionType, Property, ServerInfo, ServerInfoSnapshot,
};

/// A trait for backend drivers.
///
/// Methods take `&self`: the worker runs requests while the server keeps
/// answering queries such as [`Driver::is_connected`] from the caller's
/// thread, so implementations keep their session behind interior mutability.
pub trait Driver: Send + Sync + 'static {
    /// Called once when the server is created.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once when the server is torn down, after the worker stopped.
    fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Break a blocking call in progress. Called from the caller's thread.
    fn interrupt(&self) {}

    /// Whether a session is open.
    fn is_connected(&self) -> bool;

    /// Whether the session passed authentication.
    fn is_authenticated(&self) -> bool {
        self.is_connected()
    }

    /// The backend family.
    fn connection_type(&self) -> ConnectionType;

    /// Where the connection lives.
    fn connection_path(&self) -> ConnectionPath;

    /// Separator between commands of a multi-command text.
    fn delimiter(&self) -> &str {
        "\n"
    }

    /// Separator of namespaces inside key names.
    fn ns_separator(&self) -> &str {
        ":"
    }

    /// Builds backend-native commands.
    fn translator(&self) -> Arc<dyn Translator>;

    /// Open the session.
    fn connect(&self, ctx: &DriverContext) -> Result<()>;

    /// Close the session.
    fn disconnect(&self, ctx: &DriverContext) -> Result<()>;

    /// Enumerate databases.
    fn load_databases(&self, ctx: &DriverContext) -> Result<Vec<DatabaseMirror>>;

    /// List keys of one database with its authoritative key count.
    fn load_database_content(
        &self,
        req: &LoadContentRequest,
        ctx: &DriverContext,
    ) -> Result<DatabaseContent>;

    /// Run a backend command.
    fn execute(&self, req: &ExecuteRequest, ctx: &DriverContext) -> Result<CommandOutput>;

    /// Fetch server info.
    fn load_server_info(&self, ctx: &DriverContext) -> Result<ServerInfo>;

    /// Fetch server info and the default database.
    fn discovery_info(&self, ctx: &DriverContext) -> Result<(ServerInfo, DatabaseMirror)>;

    /// Shut the backend down.
    fn shutdown(&self, _ctx: &DriverContext) -> Result<()> {
        Err(BridgeError::Unsupported("shutdown"))
    }

    /// Dump the backend to `path`.
    fn backup(&self, _path: &Path, _ctx: &DriverContext) -> Result<()> {
        Err(BridgeError::Unsupported("backup"))
    }

    /// Load a dump from `path`.
    fn export(&self, _path: &Path, _ctx: &DriverContext) -> Result<()> {
        Err(BridgeError::Unsupported("export"))
    }

    /// Change the session password.
    fn change_password(
        &self,
        _old_password: &str,
        _new_password: &str,
        _ctx: &DriverContext,
    ) -> Result<()> {
        Err(BridgeError::Unsupported("change password"))
    }

    /// Change the connection limit, returning the limit in effect.
    fn set_max_connection(&self, _max_connections: u32, _ctx: &DriverContext) -> Result<u32> {
        Err(BridgeError::Unsupported("max connection"))
    }

    /// Fetch server properties.
    fn load_server_properties(&self, _ctx: &DriverContext) -> Result<Vec<Property>> {
        Err(BridgeError::Unsupported("server properties"))
    }

    /// Change one server property, `true` if it was applied.
    fn change_server_property(&self, _property: &Property, _ctx: &DriverContext) -> Result<bool> {
        Err(BridgeError::Unsupported("server properties"))
    }

    /// Fetch recorded server info samples.
    fn load_server_history(&self, _ctx: &DriverContext) -> Result<Vec<ServerInfoSnapshot>> {
        Err(BridgeError::Unsupported("server history"))
    }

    /// Drop recorded server info samples.
    fn clear_history(&self, _ctx: &DriverContext) -> Result<()> {
        Err(BridgeError::Unsupported("server history"))
    }

    /// List publish/subscribe channels.
    fn load_channels(&self, _pattern: &str, _ctx: &DriverContext) -> Result<Vec<Channel>> {
        Err(BridgeError::Unsupported("channels"))
    }
}

/// Raised by the server to ask the running job to stop.
#[derive(Clone, Default)]
pub struct InterruptFlag(Arc<AtomicCell<bool>>);

impl InterruptFlag {
    /// A lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running job to stop.
    pub fn raise(&self) {
        self.0.store(true);
    }

    /// Reset before the next job.
    pub fn clear(&self) {
        self.0.store(false);
    }

    /// Whether an interrupt is pending.
    pub fn is_raised(&self) -> bool {
        self.0.load()
    }
}

/// What a driver sees of the request it is serving.
pub struct DriverContext {
    id: RequestId,
    sender: Sender<Inbound>,
    interrupt: InterruptFlag,
}

impl DriverContext {
    pub(crate) fn new(id: RequestId, sender: Sender<Inbound>, interrupt: InterruptFlag) -> Self {
        DriverContext {
            id,
            sender,
            interrupt,
        }
    }

    /// Id of the request being served.
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Report a key-level observation. Delivered before the response.
    pub fn notify(&self, notice: Notice) {
        if self.sender.send(Inbound::Notice(notice)).is_err() {
            log::trace!("server gone, dropping notice of request {:?}", self.id);
        }
    }

    /// Report progress, clamped to 100.
    pub fn progress(&self, percent: u8) {
        self.notify(Notice::Progress(percent.min(100)));
    }

    /// Whether the server asked to stop.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }

    /// `Err(Interrupted)` once the server asked to stop.
    pub fn check_interrupted(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(BridgeError::Interrupted)
        } else {
            Ok(())
        }
    }
}
