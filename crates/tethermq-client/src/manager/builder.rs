//! Builder for [`ConnectionManager`]
//!
//! Provides a fluent interface for choosing the connector, probe, runtime and
//! initial observers before the manager is created.

use std::sync::Arc;

use tokio::runtime::Handle;

use tethermq_core::{ClientConfig, ConnectionObserver, Probe, SessionConnector};

use super::ConnectionManager;
use super::controller::Inner;
use crate::error::{ManagerError, ManagerResult};
use crate::probe::TcpProbe;

/// Builder for configuring and creating a [`ConnectionManager`]
///
/// # Examples
///
/// ```rust,no_run
/// use tethermq_client::ConnectionManager;
/// use tethermq_core::ClientConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::builder()
///     .broker("broker.local", 1883)
///     .max_reconnect_attempts(0)
///     .build()?;
///
/// let manager = ConnectionManager::builder(config).build()?;
/// manager.subscribe("sensors/+/temp", |msg| {
///     println!("{} = {:?}", msg.topic, msg.payload_str());
///     Ok(())
/// });
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManagerBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn SessionConnector>>,
    probe: Option<Arc<dyn Probe>>,
    runtime: Option<Handle>,
    observers: Vec<Arc<dyn ConnectionObserver>>,
}

impl std::fmt::Debug for ConnectionManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManagerBuilder")
            .field("config", &self.config)
            .field("connector", &self.connector)
            .field("probe", &self.probe)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ConnectionManagerBuilder {
    /// Create a builder for `config`
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connector: None,
            probe: None,
            runtime: None,
            observers: Vec::new(),
        }
    }

    /// Use a custom [`SessionConnector`] instead of the built-in MQTT one
    pub fn with_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a custom [`Probe`] instead of [`TcpProbe`]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Run background work on `runtime` instead of the current one
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Register an observer before any notification can be produced
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the manager. Calls [`ConnectionManager::start`] when
    /// `auto_connect` is set.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::Config`] if the configuration does not validate
    /// - [`ManagerError::NoRuntime`] if no runtime was given and none is current
    /// - [`ManagerError::MissingConnector`] if no connector was given and the
    ///   `mqtt` feature is off
    pub fn build(self) -> ManagerResult<ConnectionManager> {
        self.config.validate()?;

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| ManagerError::NoRuntime(e.to_string()))?,
        };

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };
        let probe = self.probe.unwrap_or_else(|| Arc::new(TcpProbe::new()));
        let auto_connect = self.config.auto_connect;

        let manager = ConnectionManager::from_inner(Arc::new(Inner::new(
            runtime,
            self.config,
            connector,
            probe,
            self.observers,
        )));

        if auto_connect {
            manager.start();
        }
        Ok(manager)
    }
}

#[cfg(feature = "mqtt")]
fn default_connector() -> ManagerResult<Arc<dyn SessionConnector>> {
    Ok(Arc::new(crate::mqtt::MqttConnector::new()))
}

#[cfg(not(feature = "mqtt"))]
fn default_connector() -> ManagerResult<Arc<dyn SessionConnector>> {
    Err(ManagerError::MissingConnector)
}
