//! Driver options and persisted state.
//!
//! Two XML files survive restarts: `zwcfg_0x{homeId:08x}.xml` with the
//! driver identity and one element per known node, and `zwbutton.xml` with
//! the bridge-mode button maps. Both carry a format version; files written
//! by a different format are refused, never migrated.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::command_class::{ClassFactory, PromiscuousHandler};
use crate::core::constants::{
    BUTTON_CONFIG_VERSION, CONFIG_VERSION, DEFAULT_POLL_INTERVAL_SECS,
};
use crate::core::error::ConfigError;
use crate::node::query::QueryStage;

/// Options controlling a [`Driver`](crate::driver::Driver).
#[derive(Clone)]
pub struct DriverOptions {
    /// Emit a `MsgComplete` notification for every finished transaction.
    pub notify_transactions: bool,
    /// Give up connecting after this many attempts; 0 retries forever.
    pub driver_max_attempts: u32,
    /// Directory holding the persisted state files.
    pub user_path: PathBuf,
    /// Write `zwcfg_*.xml` on shutdown.
    pub save_configuration: bool,
    /// Seconds over which the whole poll list is swept once.
    pub poll_interval_secs: u32,
    /// Factory for command-class handlers, keyed by class id.
    pub class_factory: Option<ClassFactory>,
    /// Receiver for promiscuous-mode frames.
    pub promiscuous_handler: Option<PromiscuousHandler>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            notify_transactions: false,
            driver_max_attempts: 0,
            user_path: PathBuf::from("."),
            save_configuration: true,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            class_factory: None,
            promiscuous_handler: None,
        }
    }
}

impl DriverOptions {
    /// Options with defaults: retry forever, save on shutdown, no
    /// transaction notifications, state files in the working directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `MsgComplete` notifications.
    pub fn notify_transactions(mut self, enabled: bool) -> Self {
        self.notify_transactions = enabled;
        self
    }

    /// Cap the number of connection attempts (0 = unlimited).
    pub fn driver_max_attempts(mut self, attempts: u32) -> Self {
        self.driver_max_attempts = attempts;
        self
    }

    /// Directory for the persisted state files.
    pub fn user_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_path = path.into();
        self
    }

    /// Whether to write the configuration file on shutdown.
    pub fn save_configuration(mut self, enabled: bool) -> Self {
        self.save_configuration = enabled;
        self
    }

    /// Sweep interval of the poll list, in seconds.
    pub fn poll_interval_secs(mut self, secs: u32) -> Self {
        self.poll_interval_secs = secs.max(1);
        self
    }

    /// Supply command-class handlers.
    pub fn class_factory(mut self, factory: ClassFactory) -> Self {
        self.class_factory = Some(factory);
        self
    }

    /// Supply a promiscuous-frame pass-through.
    pub fn promiscuous_handler(mut self, handler: PromiscuousHandler) -> Self {
        self.promiscuous_handler = Some(handler);
        self
    }
}

impl std::fmt::Debug for DriverOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverOptions")
            .field("notify_transactions", &self.notify_transactions)
            .field("driver_max_attempts", &self.driver_max_attempts)
            .field("user_path", &self.user_path)
            .field("save_configuration", &self.save_configuration)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("has_class_factory", &self.class_factory.is_some())
            .field("has_promiscuous_handler", &self.promiscuous_handler.is_some())
            .finish()
    }
}

/// Persisted attributes of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeRecord {
    pub node_id: u8,
    pub listening: bool,
    pub frequent_listening: bool,
    pub routing: bool,
    pub beaming: bool,
    pub security: bool,
    pub max_baud_rate: u32,
    pub protocol_version: u8,
    pub basic: u8,
    pub generic: u8,
    pub specific: u8,
    pub query_stage: QueryStage,
    pub class_ids: Vec<u8>,
}

/// Contents of a `zwcfg_*.xml` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PersistedDriver {
    pub home_id: u32,
    pub node_id: u8,
    pub api_capabilities: u8,
    pub controller_capabilities: u8,
    pub poll_interval_secs: u32,
    pub nodes: Vec<NodeRecord>,
}

/// One persisted button binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ButtonEntry {
    pub node_id: u8,
    pub button_id: u8,
    pub virtual_node_id: u8,
}

/// Path of the per-network configuration file.
pub(crate) fn config_path(user_path: &Path, home_id: u32) -> PathBuf {
    user_path.join(format!("zwcfg_0x{home_id:08x}.xml"))
}

/// Path of the button-map file.
pub(crate) fn buttons_path(user_path: &Path) -> PathBuf {
    user_path.join("zwbutton.xml")
}

/// Write the driver configuration.
pub(crate) fn save_config(user_path: &Path, driver: &PersistedDriver) -> Result<(), ConfigError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut root = BytesStart::new("Driver");
    root.push_attribute(("version", CONFIG_VERSION.to_string().as_str()));
    root.push_attribute(("home_id", format!("0x{:08x}", driver.home_id).as_str()));
    root.push_attribute(("node_id", driver.node_id.to_string().as_str()));
    root.push_attribute(("api_capabilities", driver.api_capabilities.to_string().as_str()));
    root.push_attribute((
        "controller_capabilities",
        driver.controller_capabilities.to_string().as_str(),
    ));
    root.push_attribute(("poll_interval", driver.poll_interval_secs.to_string().as_str()));
    writer.write_event(Event::Start(root))?;

    for node in &driver.nodes {
        let mut el = BytesStart::new("Node");
        el.push_attribute(("id", node.node_id.to_string().as_str()));
        el.push_attribute(("basic", node.basic.to_string().as_str()));
        el.push_attribute(("generic", node.generic.to_string().as_str()));
        el.push_attribute(("specific", node.specific.to_string().as_str()));
        el.push_attribute(("listening", bool_str(node.listening)));
        el.push_attribute(("frequent_listening", bool_str(node.frequent_listening)));
        el.push_attribute(("routing", bool_str(node.routing)));
        el.push_attribute(("beaming", bool_str(node.beaming)));
        el.push_attribute(("security", bool_str(node.security)));
        el.push_attribute(("max_baud_rate", node.max_baud_rate.to_string().as_str()));
        el.push_attribute(("version", node.protocol_version.to_string().as_str()));
        el.push_attribute(("query_stage", node.query_stage.name()));

        if node.class_ids.is_empty() {
            writer.write_event(Event::Empty(el))?;
        } else {
            writer.write_event(Event::Start(el))?;
            for class_id in &node.class_ids {
                let mut class = BytesStart::new("CommandClass");
                class.push_attribute(("id", class_id.to_string().as_str()));
                writer.write_event(Event::Empty(class))?;
            }
            writer.write_event(Event::End(BytesEnd::new("Node")))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("Driver")))?;

    let path = config_path(user_path, driver.home_id);
    fs::write(&path, writer.into_inner())?;
    info!("wrote driver config to {}", path.display());
    Ok(())
}

/// Load the driver configuration for the given network, refusing files
/// written by another format version, network or controller.
pub(crate) fn load_config(
    user_path: &Path,
    home_id: u32,
    node_id: u8,
) -> Result<PersistedDriver, ConfigError> {
    let path = config_path(user_path, home_id);
    let text = fs::read_to_string(&path)?;
    let mut reader = Reader::from_str(&text);

    let mut driver: Option<PersistedDriver> = None;

    loop {
        match reader.read_event()? {
            Event::Start(el) | Event::Empty(el) => match el.name().as_ref() {
                b"Driver" => {
                    let version = attr_u32(&el, b"version")?
                        .ok_or_else(|| malformed("Driver element lacks a version"))?;
                    if version != CONFIG_VERSION {
                        return Err(ConfigError::VersionMismatch {
                            found: version,
                            supported: CONFIG_VERSION,
                        });
                    }

                    let found_home = attr_u32(&el, b"home_id")?
                        .ok_or_else(|| malformed("Driver element lacks a home id"))?;
                    if found_home != home_id {
                        return Err(ConfigError::HomeIdMismatch {
                            found: found_home,
                            expected: home_id,
                        });
                    }

                    let found_node = attr_u32(&el, b"node_id")?
                        .ok_or_else(|| malformed("Driver element lacks a node id"))?
                        as u8;
                    if found_node != node_id {
                        return Err(ConfigError::NodeIdMismatch {
                            found: found_node,
                            expected: node_id,
                        });
                    }

                    driver = Some(PersistedDriver {
                        home_id,
                        node_id,
                        api_capabilities: attr_u32(&el, b"api_capabilities")?.unwrap_or(0) as u8,
                        controller_capabilities: attr_u32(&el, b"controller_capabilities")?
                            .unwrap_or(0) as u8,
                        poll_interval_secs: attr_u32(&el, b"poll_interval")?
                            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
                        nodes: Vec::new(),
                    });
                }
                b"Node" => {
                    let driver = driver
                        .as_mut()
                        .ok_or_else(|| malformed("Node element outside Driver"))?;
                    driver.nodes.push(parse_node(&el)?);
                }
                b"CommandClass" => {
                    let node = driver
                        .as_mut()
                        .and_then(|d| d.nodes.last_mut())
                        .ok_or_else(|| malformed("CommandClass element outside Node"))?;
                    if let Some(id) = attr_u32(&el, b"id")? {
                        node.class_ids.push(id as u8);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    driver.ok_or_else(|| malformed("no Driver element found"))
}

fn parse_node(el: &BytesStart<'_>) -> Result<NodeRecord, ConfigError> {
    let node_id =
        attr_u32(el, b"id")?.ok_or_else(|| malformed("Node element lacks an id"))? as u8;
    let stage = attr_string(el, b"query_stage")?
        .and_then(|name| QueryStage::from_name(&name))
        .unwrap_or(QueryStage::None);
    Ok(NodeRecord {
        node_id,
        listening: attr_bool(el, b"listening")?.unwrap_or(true),
        frequent_listening: attr_bool(el, b"frequent_listening")?.unwrap_or(false),
        routing: attr_bool(el, b"routing")?.unwrap_or(false),
        beaming: attr_bool(el, b"beaming")?.unwrap_or(false),
        security: attr_bool(el, b"security")?.unwrap_or(false),
        max_baud_rate: attr_u32(el, b"max_baud_rate")?.unwrap_or(0),
        protocol_version: attr_u32(el, b"version")?.unwrap_or(0) as u8,
        basic: attr_u32(el, b"basic")?.unwrap_or(0) as u8,
        generic: attr_u32(el, b"generic")?.unwrap_or(0) as u8,
        specific: attr_u32(el, b"specific")?.unwrap_or(0) as u8,
        query_stage: stage,
        class_ids: Vec::new(),
    })
}

/// Write the button maps of every node that has one.
pub(crate) fn save_buttons(user_path: &Path, entries: &[ButtonEntry]) -> Result<(), ConfigError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut root = BytesStart::new("Nodes");
    root.push_attribute(("version", BUTTON_CONFIG_VERSION.to_string().as_str()));
    writer.write_event(Event::Start(root))?;

    let mut index = 0;
    while index < entries.len() {
        let node_id = entries[index].node_id;
        let mut el = BytesStart::new("Node");
        el.push_attribute(("id", node_id.to_string().as_str()));
        writer.write_event(Event::Start(el))?;

        while index < entries.len() && entries[index].node_id == node_id {
            let entry = entries[index];
            let mut button = BytesStart::new("Button");
            button.push_attribute(("id", entry.button_id.to_string().as_str()));
            writer.write_event(Event::Start(button))?;
            writer.write_event(Event::Text(BytesText::new(
                &entry.virtual_node_id.to_string(),
            )))?;
            writer.write_event(Event::End(BytesEnd::new("Button")))?;
            index += 1;
        }

        writer.write_event(Event::End(BytesEnd::new("Node")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("Nodes")))?;

    fs::write(buttons_path(user_path), writer.into_inner())?;
    Ok(())
}

/// Load all persisted button bindings. A missing file is an empty map, a
/// malformed or wrong-version file is refused.
pub(crate) fn load_buttons(user_path: &Path) -> Result<Vec<ButtonEntry>, ConfigError> {
    let path = buttons_path(user_path);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("{} not found, starting with empty button maps", path.display());
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };

    let mut reader = Reader::from_str(&text);
    let mut entries = Vec::new();
    let mut seen_root = false;
    let mut current_node: Option<u8> = None;
    let mut current_button: Option<u8> = None;

    loop {
        match reader.read_event()? {
            Event::Start(el) | Event::Empty(el) => match el.name().as_ref() {
                b"Nodes" => {
                    let version = attr_u32(&el, b"version")?
                        .ok_or_else(|| malformed("Nodes element lacks a version"))?;
                    if version != BUTTON_CONFIG_VERSION {
                        return Err(ConfigError::VersionMismatch {
                            found: version,
                            supported: BUTTON_CONFIG_VERSION,
                        });
                    }
                    seen_root = true;
                }
                b"Node" => {
                    current_node = attr_u32(&el, b"id")?.map(|id| id as u8);
                }
                b"Button" => {
                    current_button = attr_u32(&el, b"id")?.map(|id| id as u8);
                }
                _ => {}
            },
            Event::Text(text) => {
                if let (Some(node_id), Some(button_id)) = (current_node, current_button) {
                    let value = std::str::from_utf8(text.as_ref())
                        .map_err(|_| malformed("button value is not utf-8"))?
                        .trim()
                        .to_string();
                    if !value.is_empty() {
                        let virtual_node_id = parse_u32(&value)
                            .ok_or_else(|| malformed("button value is not a number"))?
                            as u8;
                        entries.push(ButtonEntry {
                            node_id,
                            button_id,
                            virtual_node_id,
                        });
                    }
                }
            }
            Event::End(el) => match el.name().as_ref() {
                b"Button" => current_button = None,
                b"Node" => current_node = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(malformed("no Nodes element found"));
    }
    Ok(entries)
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn malformed(what: &str) -> ConfigError {
    ConfigError::Malformed(what.to_string())
}

fn attr_string(el: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, ConfigError> {
    for attr in el.attributes() {
        let attr = attr.map_err(|e| malformed(&e.to_string()))?;
        if attr.key.as_ref() == name {
            let value = std::str::from_utf8(&attr.value)
                .map_err(|_| malformed("attribute value is not utf-8"))?;
            return Ok(Some(value.to_string()));
        }
    }
    Ok(None)
}

fn attr_u32(el: &BytesStart<'_>, name: &[u8]) -> Result<Option<u32>, ConfigError> {
    match attr_string(el, name)? {
        Some(value) => parse_u32(&value)
            .map(Some)
            .ok_or_else(|| malformed(&format!("attribute value {value:?} is not a number"))),
        None => Ok(None),
    }
}

fn attr_bool(el: &BytesStart<'_>, name: &[u8]) -> Result<Option<bool>, ConfigError> {
    match attr_string(el, name)? {
        Some(value) => match value.as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            other => Err(malformed(&format!("attribute value {other:?} is not a bool"))),
        },
        None => Ok(None),
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_u32(value: &str) -> Option<u32> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_dir() -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "zwave-driver-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_driver() -> PersistedDriver {
        PersistedDriver {
            home_id: 0x0123_abcd,
            node_id: 1,
            api_capabilities: 0x08,
            controller_capabilities: 0x1c,
            poll_interval_secs: 60,
            nodes: vec![
                NodeRecord {
                    node_id: 2,
                    listening: true,
                    frequent_listening: false,
                    routing: true,
                    beaming: true,
                    security: false,
                    max_baud_rate: 40_000,
                    protocol_version: 4,
                    basic: 0x04,
                    generic: 0x10,
                    specific: 0x01,
                    query_stage: QueryStage::Complete,
                    class_ids: vec![0x25, 0x27],
                },
                NodeRecord {
                    node_id: 7,
                    listening: false,
                    frequent_listening: false,
                    routing: false,
                    beaming: false,
                    security: false,
                    max_baud_rate: 9_600,
                    protocol_version: 3,
                    basic: 0x04,
                    generic: 0x21,
                    specific: 0x01,
                    query_stage: QueryStage::Associations,
                    class_ids: vec![0x84, 0x31],
                },
            ],
        }
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = scratch_dir();
        let driver = sample_driver();

        save_config(&dir, &driver).unwrap();
        let loaded = load_config(&dir, driver.home_id, driver.node_id).unwrap();

        assert_eq!(loaded, driver);
    }

    #[test]
    fn test_config_refuses_other_home_id() {
        let dir = scratch_dir();
        let mut driver = sample_driver();
        save_config(&dir, &driver).unwrap();

        // Same file name, different network inside.
        driver.home_id = 0xdead_beef;
        let path = config_path(&dir, 0x0123_abcd);
        let new_path = config_path(&dir, 0xdead_beef);
        fs::rename(path, new_path).unwrap();

        let err = load_config(&dir, 0xdead_beef, 1).unwrap_err();
        assert!(matches!(err, ConfigError::HomeIdMismatch { .. }));
    }

    #[test]
    fn test_config_refuses_other_version() {
        let dir = scratch_dir();
        let driver = sample_driver();
        save_config(&dir, &driver).unwrap();

        let path = config_path(&dir, driver.home_id);
        let text = fs::read_to_string(&path)
            .unwrap()
            .replace(&format!("version=\"{CONFIG_VERSION}\""), "version=\"999\"");
        fs::write(&path, text).unwrap();

        let err = load_config(&dir, driver.home_id, driver.node_id).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::VersionMismatch { found: 999, .. }
        ));
    }

    #[test]
    fn test_config_missing_file_is_io_error() {
        let dir = scratch_dir();
        let err = load_config(&dir, 0x1111_2222, 1).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_buttons_roundtrip() {
        let dir = scratch_dir();
        let entries = vec![
            ButtonEntry {
                node_id: 3,
                button_id: 1,
                virtual_node_id: 200,
            },
            ButtonEntry {
                node_id: 3,
                button_id: 2,
                virtual_node_id: 201,
            },
            ButtonEntry {
                node_id: 5,
                button_id: 1,
                virtual_node_id: 202,
            },
        ];

        save_buttons(&dir, &entries).unwrap();
        let loaded = load_buttons(&dir).unwrap();
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_buttons_missing_file_is_empty() {
        let dir = scratch_dir();
        assert!(load_buttons(&dir).unwrap().is_empty());
    }

    #[test]
    fn test_options_builder() {
        let options = DriverOptions::new()
            .notify_transactions(true)
            .driver_max_attempts(5)
            .poll_interval_secs(0)
            .save_configuration(false)
            .user_path("/tmp/zw");

        assert!(options.notify_transactions);
        assert_eq!(options.driver_max_attempts, 5);
        // Clamped to at least one second.
        assert_eq!(options.poll_interval_secs, 1);
        assert!(!options.save_configuration);
        assert_eq!(options.user_path, PathBuf::from("/tmp/zw"));
    }
}
