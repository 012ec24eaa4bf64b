//! Static catalog of supported debug adapters.
//!
//! Each [`AdapterKind`] maps to one capability record: its names, the DAP
//! `adapterID`, the source extensions it handles, and how to start it,
//! either over stdio or as a server told to listen on a free port.
//! [`AdapterCatalog`] layers configuration overrides on top and
//! resolves a kind plus a [`Target`] into an [`AdapterEndpoint`] and the
//! opaque launch/attach payload forwarded in the handshake.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::BridgeConfig;
use crate::dap::transport::{AdapterEndpoint, ListenArg};
use crate::{AppError, Result};

/// Supported adapter families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Python via `debugpy`.
    Debugpy,
    /// Rust, C and C++ via `CodeLLDB`.
    CodeLldb,
    /// Go via Delve.
    Delve,
    /// JavaScript and TypeScript on Node.js via `js-debug`.
    JsDebug,
    /// Java via `java-debug`.
    JavaDebug,
}

/// Capability record of one adapter kind.
struct AdapterSpec {
    kind: AdapterKind,
    name: &'static str,
    aliases: &'static [&'static str],
    adapter_id: &'static str,
    extensions: &'static [&'static str],
    /// Launch command; `None` when the adapter cannot be spawned.
    command: Option<&'static str>,
    args: &'static [&'static str],
    /// Listen argument template for adapters that serve DAP over TCP
    /// instead of stdio.
    listen: Option<&'static str>,
    /// Attaching still goes through a spawned adapter; the target address
    /// only lands in the payload.
    attach_spawns: bool,
}

const ADAPTERS: [AdapterSpec; 5] = [
    AdapterSpec {
        kind: AdapterKind::Debugpy,
        name: "debugpy",
        aliases: &["python"],
        adapter_id: "debugpy",
        extensions: &["py", "pyw"],
        command: Some("python3"),
        args: &["-m", "debugpy.adapter"],
        listen: None,
        attach_spawns: false,
    },
    AdapterSpec {
        kind: AdapterKind::CodeLldb,
        name: "codelldb",
        aliases: &["lldb", "rust"],
        adapter_id: "lldb",
        extensions: &["rs", "c", "cpp", "cc", "cxx", "h", "hpp"],
        command: Some("codelldb"),
        args: &[],
        listen: None,
        attach_spawns: false,
    },
    AdapterSpec {
        kind: AdapterKind::Delve,
        name: "delve",
        aliases: &["go", "dlv"],
        adapter_id: "go",
        extensions: &["go"],
        command: Some("dlv"),
        args: &["dap"],
        listen: Some("--listen={host}:{port}"),
        attach_spawns: false,
    },
    AdapterSpec {
        kind: AdapterKind::JsDebug,
        name: "jsdebug",
        aliases: &["js-debug", "node", "javascript", "typescript", "pwa-node"],
        adapter_id: "pwa-node",
        extensions: &["js", "ts", "mjs", "cjs", "mts", "cts"],
        command: Some("node"),
        args: &["dapDebugServer.js"],
        listen: Some("{port}"),
        attach_spawns: true,
    },
    AdapterSpec {
        kind: AdapterKind::JavaDebug,
        name: "javadebug",
        aliases: &["java-debug", "java"],
        adapter_id: "java",
        extensions: &["java"],
        command: Some("java"),
        args: &["--add-modules", "jdk.jdi", "-Dfile.encoding=UTF-8", "StandaloneLauncher"],
        listen: None,
        attach_spawns: true,
    },
];

impl AdapterKind {
    /// Every supported kind, in catalog order.
    pub const ALL: [Self; 5] = [
        Self::Debugpy,
        Self::CodeLldb,
        Self::Delve,
        Self::JsDebug,
        Self::JavaDebug,
    ];

    fn spec(self) -> &'static AdapterSpec {
        match self {
            Self::Debugpy => &ADAPTERS[0],
            Self::CodeLldb => &ADAPTERS[1],
            Self::Delve => &ADAPTERS[2],
            Self::JsDebug => &ADAPTERS[3],
            Self::JavaDebug => &ADAPTERS[4],
        }
    }

    /// Look up a kind by primary name or alias, ignoring case.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        ADAPTERS
            .iter()
            .find(|spec| {
                spec.name.eq_ignore_ascii_case(name)
                    || spec.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(name))
            })
            .map(|spec| spec.kind)
    }

    /// Pick the adapter handling `path` by its extension.
    #[must_use]
    pub fn for_source(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        ADAPTERS
            .iter()
            .find(|spec| spec.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .map(|spec| spec.kind)
    }

    /// Primary name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// DAP `adapterID` sent in `initialize`.
    #[must_use]
    pub fn adapter_id(self) -> &'static str {
        self.spec().adapter_id
    }
}

impl Display for AdapterKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AdapterKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| AppError::Config(format!("unknown adapter: {s}")))
    }
}

/// How the bridge reaches the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Spawn the adapter and launch the debuggee through it.
    Launch,
    /// Attach to a debug server listening on `host:port`. For `js-debug`
    /// and `java-debug` the adapter is spawned and `host:port` is the
    /// inspector or JDWP address it attaches to.
    Attach {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
}

/// Debuggee parameters for a launch payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Program to debug.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory for the debuggee.
    pub cwd: Option<String>,
    /// Extra debuggee environment.
    pub env: HashMap<String, String>,
    /// Stop at the program entry point.
    pub stop_on_entry: bool,
}

/// One adapter after configuration overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct AdapterDescription {
    /// Adapter kind.
    pub kind: AdapterKind,
    /// Primary name.
    pub name: &'static str,
    /// Accepted aliases.
    pub aliases: Vec<&'static str>,
    /// DAP `adapterID`.
    pub adapter_id: &'static str,
    /// Handled source extensions.
    pub extensions: Vec<&'static str>,
    /// Whether sessions may be created.
    pub enabled: bool,
    /// Launch command, if the adapter can be launched.
    pub command: Option<String>,
    /// Arguments for the launch command.
    pub args: Vec<String>,
    /// Listen argument template when the adapter is reached over TCP after
    /// being spawned; `None` for stdio.
    pub listen: Option<&'static str>,
}

/// Adapter catalog with configuration overrides applied.
#[derive(Debug, Clone)]
pub struct AdapterCatalog {
    entries: Vec<AdapterDescription>,
}

impl Default for AdapterCatalog {
    fn default() -> Self {
        Self::new(&BridgeConfig::default())
    }
}

impl AdapterCatalog {
    /// Build the catalog, applying `[adapters.<name>]` overrides.
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        let entries = ADAPTERS
            .iter()
            .map(|spec| {
                let overrides = config.adapter_override(spec.kind);
                let command = overrides
                    .and_then(|o| o.command.clone())
                    .or_else(|| spec.command.map(str::to_owned));
                let args = overrides
                    .and_then(|o| o.args.clone())
                    .unwrap_or_else(|| spec.args.iter().map(|a| (*a).to_owned()).collect());

                AdapterDescription {
                    kind: spec.kind,
                    name: spec.name,
                    aliases: spec.aliases.to_vec(),
                    adapter_id: spec.adapter_id,
                    extensions: spec.extensions.to_vec(),
                    enabled: overrides.is_none_or(|o| o.enabled),
                    command,
                    args,
                    listen: spec.listen,
                }
            })
            .collect();
        Self { entries }
    }

    /// Every adapter with its effective settings.
    #[must_use]
    pub fn describe(&self) -> &[AdapterDescription] {
        &self.entries
    }

    fn entry(&self, kind: AdapterKind) -> Result<&AdapterDescription> {
        self.entries
            .iter()
            .find(|entry| entry.kind == kind)
            .ok_or_else(|| AppError::Config(format!("adapter {kind} is not in the catalog")))
    }

    /// Resolve how to reach `kind` for `target`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the adapter is disabled, or if it has
    /// to be spawned but has no command configured.
    pub fn resolve(&self, kind: AdapterKind, target: &Target) -> Result<AdapterEndpoint> {
        let entry = self.entry(kind)?;
        if !entry.enabled {
            return Err(AppError::Config(format!("adapter {kind} is disabled")));
        }

        match target {
            Target::Attach { host, port } if !kind.spec().attach_spawns => {
                Ok(AdapterEndpoint::socket(host.clone(), *port))
            }
            Target::Launch | Target::Attach { .. } => {
                let command = entry.command.clone().ok_or_else(|| {
                    AppError::Config(format!("adapter {kind} has no launch command"))
                })?;
                Ok(match entry.listen {
                    Some(template) => {
                        AdapterEndpoint::spawn_socket(command, entry.args.clone(), template)
                    }
                    None => AdapterEndpoint::process(command, entry.args.clone()),
                })
            }
        }
    }

    /// Build the `launch` payload for `kind`.
    ///
    /// For `java-debug` the program is a `.java` source file; the main class
    /// is derived from its file name and `package` declaration.
    #[must_use]
    pub fn launch_arguments(&self, kind: AdapterKind, options: &LaunchOptions) -> Value {
        let mut args = Map::new();
        args.insert("request".into(), json!("launch"));
        if kind == AdapterKind::JavaDebug {
            args.insert("type".into(), json!("java"));
            args.insert("mainClass".into(), json!(main_class(Path::new(&options.program))));
            let class_path = Path::new(&options.program)
                .parent()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default();
            args.insert("classPaths".into(), json!([class_path]));
            args.insert("args".into(), json!(options.args.join(" ")));
            args.insert("encoding".into(), json!("UTF-8"));
        } else {
            args.insert("program".into(), json!(options.program));
            args.insert("args".into(), json!(options.args));
        }
        args.insert("stopOnEntry".into(), json!(options.stop_on_entry));
        if let Some(cwd) = &options.cwd {
            args.insert("cwd".into(), json!(cwd));
        }
        if !options.env.is_empty() {
            args.insert("env".into(), json!(options.env));
        }

        match kind {
            AdapterKind::Debugpy => {
                args.insert("console".into(), json!("internalConsole"));
                args.insert("redirectOutput".into(), json!(true));
                args.insert("justMyCode".into(), json!(true));
            }
            AdapterKind::CodeLldb => {
                args.insert("sourceLanguages".into(), json!(["rust"]));
            }
            AdapterKind::Delve => {
                args.insert("mode".into(), json!("debug"));
            }
            AdapterKind::JsDebug => {
                args.insert("type".into(), json!("pwa-node"));
                args.insert("console".into(), json!("internalConsole"));
                args.insert("sourceMaps".into(), json!(true));
            }
            AdapterKind::JavaDebug => {}
        }
        Value::Object(args)
    }

    /// Build the `attach` payload for `kind` reached at `host:port`.
    #[must_use]
    pub fn attach_arguments(&self, kind: AdapterKind, host: &str, port: u16) -> Value {
        match kind {
            AdapterKind::Debugpy => json!({
                "request": "attach",
                "connect": { "host": host, "port": port },
                "justMyCode": true,
            }),
            AdapterKind::CodeLldb => json!({ "request": "attach" }),
            AdapterKind::Delve => json!({ "request": "attach", "mode": "remote" }),
            AdapterKind::JsDebug => json!({
                "type": "pwa-node",
                "request": "attach",
                "address": host,
                "port": port,
                "sourceMaps": true,
            }),
            AdapterKind::JavaDebug => json!({
                "type": "java",
                "request": "attach",
                "hostName": host,
                "port": port,
            }),
        }
    }
}

/// Fully qualified class name for a Java source file: the file stem,
/// prefixed with the `package` declared before the first type.
fn main_class(source: &Path) -> String {
    let class = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Ok(text) = std::fs::read_to_string(source) else {
        return class;
    };
    for line in text.lines().map(str::trim) {
        if let Some(package) = line.strip_prefix("package ") {
            let package = package.trim_end_matches(';').trim();
            return format!("{package}.{class}");
        }
        if ["import ", "public ", "class ", "abstract ", "final "]
            .iter()
            .any(|prefix| line.starts_with(prefix))
        {
            break;
        }
    }
    class
}
