/*!
 * BlueZ Bus Client
 * Thin async wrapper over org.bluez on the D-Bus system bus
 */

use async_trait::async_trait;
use dbus::arg::{ArgType, PropMap, RefArg};
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties as DBusProperties};
use dbus::nonblock::{Proxy, SyncConnection};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// Errors meaning the object (or the whole service) we talked to is gone.
const STALE_ERROR_NAMES: &[&str] = &[
    "org.freedesktop.DBus.Error.UnknownObject",
    "org.freedesktop.DBus.Error.ServiceUnknown",
    "org.freedesktop.DBus.Error.NameHasNoOwner",
    "org.freedesktop.DBus.Error.Disconnected",
];

/// BlueZ's answer when an object passed as an argument is unknown.
const MISSING_ERROR_NAME: &str = "org.bluez.Error.DoesNotExist";

/// Property set of one interface, already converted to JSON.
pub type Properties = Map<String, Value>;
/// Interface name -> properties.
pub type InterfaceMap = BTreeMap<String, Properties>;
/// Object path -> interfaces, as returned by `GetManagedObjects`.
pub type ManagedObjects = BTreeMap<String, InterfaceMap>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Object or service no longer exists; cached handles must be re-resolved.
    #[error("{0}")]
    Stale(String),
    /// The callee is fine but an object named in the arguments is gone.
    #[error("{0}")]
    Missing(String),
    #[error("{0}")]
    Failed(String),
}

impl BusError {
    /// Some object involved in the call no longer exists.
    pub fn is_stale(&self) -> bool {
        matches!(self, BusError::Stale(_) | BusError::Missing(_))
    }

    /// The object the call was sent to is gone, so its handle is useless.
    pub fn is_callee_gone(&self) -> bool {
        matches!(self, BusError::Stale(_))
    }
}

impl From<dbus::Error> for BusError {
    fn from(err: dbus::Error) -> Self {
        let message = err.message().unwrap_or("unknown D-Bus error");
        match err.name() {
            Some(name) if STALE_ERROR_NAMES.contains(&name) => {
                BusError::Stale(format!("{}: {}", name, message))
            }
            Some(name) if name == MISSING_ERROR_NAME => {
                BusError::Missing(format!("{}: {}", name, message))
            }
            Some(name) => BusError::Failed(format!("{}: {}", name, message)),
            None => BusError::Failed(message.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Connect,
    Disconnect,
    Pair,
}

impl DeviceCommand {
    pub fn method(self) -> &'static str {
        match self {
            DeviceCommand::Connect => "Connect",
            DeviceCommand::Disconnect => "Disconnect",
            DeviceCommand::Pair => "Pair",
        }
    }
}

/// Operations the daemon needs from the Bluetooth management service.
#[async_trait]
pub trait BluetoothBus: Send + Sync {
    async fn managed_objects(&self) -> Result<ManagedObjects, BusError>;

    async fn properties(&self, path: &str, interface: &str) -> Result<Properties, BusError>;

    async fn start_discovery(&self, adapter: &str) -> Result<(), BusError>;

    async fn stop_discovery(&self, adapter: &str) -> Result<(), BusError>;

    async fn remove_device(&self, adapter: &str, device: &str) -> Result<(), BusError>;

    async fn device_command(&self, device: &str, command: DeviceCommand) -> Result<(), BusError>;
}

/// First object exposing the adapter interface, in path order.
pub fn find_adapter(objects: &ManagedObjects) -> Option<String> {
    objects
        .iter()
        .find(|(_, interfaces)| interfaces.contains_key(ADAPTER_INTERFACE))
        .map(|(path, _)| path.clone())
}

pub struct BluezClient {
    conn: Arc<SyncConnection>,
    timeout: Duration,
}

impl BluezClient {
    /// Connects to the system bus. The returned task drives the connection
    /// and must stay alive for as long as the client is used.
    pub fn connect(timeout: Duration) -> Result<(Self, JoinHandle<()>), BusError> {
        let (resource, conn) = dbus_tokio::connection::new_system_sync()?;

        let driver = tokio::spawn(async move {
            let err = resource.await;
            tracing::error!("Lost connection to the system bus: {}", err);
        });

        Ok((Self { conn, timeout }, driver))
    }

    fn proxy(&self, path: &str) -> Result<Proxy<'static, Arc<SyncConnection>>, BusError> {
        let path = dbus::Path::new(path.to_owned())
            .map_err(|e| BusError::Failed(format!("invalid object path: {}", e)))?;
        Ok(Proxy::new(BLUEZ_SERVICE, path, self.timeout, self.conn.clone()))
    }

    async fn call(&self, path: &str, interface: &str, method: &str) -> Result<(), BusError> {
        let proxy = self.proxy(path)?;
        let reply: Result<(), dbus::Error> = proxy.method_call(interface, method, ()).await;
        reply.map_err(BusError::from)
    }
}

#[async_trait]
impl BluetoothBus for BluezClient {
    async fn managed_objects(&self) -> Result<ManagedObjects, BusError> {
        let proxy = self.proxy("/")?;
        let objects = proxy.get_managed_objects().await?;

        Ok(objects
            .into_iter()
            .map(|(path, interfaces)| {
                let interfaces = interfaces
                    .into_iter()
                    .map(|(name, props)| (name, props_to_json(&props)))
                    .collect();
                (path.to_string(), interfaces)
            })
            .collect())
    }

    async fn properties(&self, path: &str, interface: &str) -> Result<Properties, BusError> {
        let proxy = self.proxy(path)?;
        let props = proxy.get_all(interface).await?;
        Ok(props_to_json(&props))
    }

    async fn start_discovery(&self, adapter: &str) -> Result<(), BusError> {
        self.call(adapter, ADAPTER_INTERFACE, "StartDiscovery").await
    }

    async fn stop_discovery(&self, adapter: &str) -> Result<(), BusError> {
        self.call(adapter, ADAPTER_INTERFACE, "StopDiscovery").await
    }

    async fn remove_device(&self, adapter: &str, device: &str) -> Result<(), BusError> {
        let device = dbus::Path::new(device.to_owned())
            .map_err(|e| BusError::Failed(format!("invalid object path: {}", e)))?;
        let proxy = self.proxy(adapter)?;
        let reply: Result<(), dbus::Error> = proxy
            .method_call(ADAPTER_INTERFACE, "RemoveDevice", (device,))
            .await;
        reply.map_err(BusError::from)
    }

    async fn device_command(&self, device: &str, command: DeviceCommand) -> Result<(), BusError> {
        self.call(device, DEVICE_INTERFACE, command.method()).await
    }
}

pub fn props_to_json(props: &PropMap) -> Properties {
    props
        .iter()
        .map(|(key, value)| (key.clone(), ref_arg_to_json(&*value.0)))
        .collect()
}

fn ref_arg_to_json(value: &dyn RefArg) -> Value {
    match value.arg_type() {
        ArgType::Boolean => value.as_u64().map_or(Value::Null, |v| Value::Bool(v != 0)),
        ArgType::Byte | ArgType::UInt16 | ArgType::UInt32 | ArgType::UInt64 => {
            value.as_u64().map_or(Value::Null, Value::from)
        }
        ArgType::Int16 | ArgType::Int32 | ArgType::Int64 => {
            value.as_i64().map_or(Value::Null, Value::from)
        }
        ArgType::Double => value.as_f64().map_or(Value::Null, Value::from),
        ArgType::String | ArgType::ObjectPath | ArgType::Signature => value
            .as_str()
            .map_or(Value::Null, |s| Value::String(s.to_owned())),
        ArgType::Variant => value
            .as_iter()
            .and_then(|mut inner| inner.next().map(ref_arg_to_json))
            .unwrap_or(Value::Null),
        ArgType::Array if value.signature().starts_with("a{") => dict_to_json(value),
        ArgType::Array | ArgType::Struct | ArgType::DictEntry => value
            .as_iter()
            .map_or(Value::Null, |items| Value::Array(items.map(ref_arg_to_json).collect())),
        _ => Value::Null,
    }
}

// Dict iterators yield key and value alternately.
fn dict_to_json(value: &dyn RefArg) -> Value {
    let Some(mut items) = value.as_iter() else {
        return Value::Null;
    };

    let mut map = Map::new();
    while let (Some(key), Some(val)) = (items.next(), items.next()) {
        let key = match key.as_str() {
            Some(s) => s.to_owned(),
            None => ref_arg_to_json(key).to_string(),
        };
        map.insert(key, ref_arg_to_json(val));
    }
    Value::Object(map)
}


#[cfg(test)]
mod tests {
    use super::*;
    use dbus::arg::Variant;
    use serde_json::json;
    use std::collections::HashMap;

    fn variant<T: RefArg + 'static>(value: T) -> Variant<Box<dyn RefArg>> {
        Variant(Box::new(value))
    }

    #[test]
    fn converts_bluez_device_properties() {
        let mut props: PropMap = HashMap::new();
        props.insert("Name".into(), variant("JBL Flip 5".to_string()));
        props.insert("Paired".into(), variant(true));
        props.insert("RSSI".into(), variant(-67i16));
        props.insert("Class".into(), variant(2360344u32));
        props.insert(
            "UUIDs".into(),
            variant(vec!["0000110b-0000-1000-8000-00805f9b34fb".to_string()]),
        );

        let json = props_to_json(&props);

        assert_eq!(json["Name"], json!("JBL Flip 5"));
        assert_eq!(json["Paired"], json!(true));
        assert_eq!(json["RSSI"], json!(-67));
        assert_eq!(json["Class"], json!(2360344));
        assert_eq!(json["UUIDs"], json!(["0000110b-0000-1000-8000-00805f9b34fb"]));
    }

    #[test]
    fn converts_nested_dictionaries() {
        let mut inner: PropMap = HashMap::new();
        inner.insert("Level".into(), variant(80u8));

        let mut props: PropMap = HashMap::new();
        props.insert("Battery".into(), variant(inner));

        let json = props_to_json(&props);
        assert_eq!(json["Battery"], json!({ "Level": 80 }));
    }

    #[test]
    fn stale_errors_are_detected_by_name() {
        let err = dbus::Error::new_custom("org.freedesktop.DBus.Error.UnknownObject", "gone");
        assert!(BusError::from(err).is_stale());

        let err = dbus::Error::new_custom("org.bluez.Error.Failed", "Page Timeout");
        let err = BusError::from(err);
        assert!(!err.is_stale());
        assert_eq!(err.to_string(), "org.bluez.Error.Failed: Page Timeout");
    }

    #[test]
    fn missing_argument_object_is_stale_but_not_the_callee() {
        let err = dbus::Error::new_custom("org.bluez.Error.DoesNotExist", "Does Not Exist");
        let err = BusError::from(err);
        assert!(err.is_stale());
        assert!(!err.is_callee_gone());

        let err = dbus::Error::new_custom("org.freedesktop.DBus.Error.ServiceUnknown", "gone");
        assert!(BusError::from(err).is_callee_gone());
    }

    #[test]
    fn adapter_is_first_object_with_adapter_interface() {
        let mut objects = ManagedObjects::new();
        objects
            .entry("/org/bluez/hci1".into())
            .or_default()
            .insert(ADAPTER_INTERFACE.into(), Properties::new());
        objects
            .entry("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF".into())
            .or_default()
            .insert(DEVICE_INTERFACE.into(), Properties::new());
        objects
            .entry("/org/bluez/hci0".into())
            .or_default()
            .insert(ADAPTER_INTERFACE.into(), Properties::new());

        assert_eq!(find_adapter(&objects).as_deref(), Some("/org/bluez/hci0"));
        assert_eq!(find_adapter(&ManagedObjects::new()), None);
    }
}
