//! Device-side IoT tools built from the descriptors a device reports.
//!
//! A descriptor such as
//!
//! ```json
//! {"name":"Speaker","description":"扬声器",
//!  "properties":{"volume":{"description":"当前音量","type":"number"}},
//!  "methods":{"SetVolume":{"description":"设置音量",
//!             "parameters":{"volume":{"description":"0-100","type":"number"}}}}}
//! ```
//!
//! yields `get_speaker_volume` and `speaker_setvolume`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    ToolArgs, ToolCategory, ToolContext, ToolDefinition, ToolError, ToolExecutor, ToolOutput,
    ToolResult, args_to_json,
};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IotProperty {
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IotMethod {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, IotProperty>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IotDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: BTreeMap<String, IotProperty>,
    #[serde(default)]
    pub methods: BTreeMap<String, IotMethod>,
}

#[derive(Debug, Deserialize)]
struct IotStateUpdate {
    name: String,
    #[serde(default)]
    state: Map<String, Value>,
}

#[derive(Debug, Clone)]
enum IotBinding {
    Property { device: String, property: String },
    Method { device: String, method: String },
}

struct Catalog {
    definitions: Vec<ToolDefinition>,
    bindings: HashMap<String, IotBinding>,
}

fn json_type(kind: &str) -> &'static str {
    match kind.to_ascii_lowercase().as_str() {
        "number" | "float" => "number",
        "integer" | "int" => "integer",
        "boolean" | "bool" => "boolean",
        _ => "string",
    }
}

/// Tools of the IoT devices attached to one session.
pub struct IotExecutor {
    catalog: RwLock<Catalog>,
    states: RwLock<HashMap<String, Map<String, Value>>>,
    updates: watch::Sender<u64>,
    state_wait: Duration,
}

impl IotExecutor {
    pub fn new(state_wait: Duration) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            catalog: RwLock::new(Catalog {
                definitions: Vec::new(),
                bindings: HashMap::new(),
            }),
            states: RwLock::new(HashMap::new()),
            updates,
            state_wait,
        }
    }

    /// Merge descriptors and return the names of newly created tools.
    pub fn register_descriptors(&self, descriptors: &[Value]) -> Vec<String> {
        let mut catalog = self.catalog.write();
        let mut added = Vec::new();

        for raw in descriptors {
            let descriptor: IotDescriptor = match serde_json::from_value(raw.clone()) {
                Ok(d) => d,
                Err(e) => {
                    debug!("Ignoring malformed IoT descriptor: {}", e);
                    continue;
                }
            };
            let device = descriptor.name.to_lowercase();

            for (property, spec) in &descriptor.properties {
                let name = format!("get_{}_{}", device, property.to_lowercase());
                if catalog.bindings.contains_key(&name) {
                    continue;
                }
                catalog.definitions.push(ToolDefinition::new(
                    name.clone(),
                    format!("查询{}的{}", descriptor.description_or_name(), spec.description),
                    json!({"type": "object", "properties": {}}),
                    ToolCategory::DeviceIot,
                ));
                catalog.bindings.insert(
                    name.clone(),
                    IotBinding::Property {
                        device: descriptor.name.clone(),
                        property: property.clone(),
                    },
                );
                added.push(name);
            }

            for (method, spec) in &descriptor.methods {
                let name = format!("{}_{}", device, method.to_lowercase());
                if catalog.bindings.contains_key(&name) {
                    continue;
                }
                let properties: Map<String, Value> = spec
                    .parameters
                    .iter()
                    .map(|(param, p)| {
                        (
                            param.clone(),
                            json!({"type": json_type(&p.kind), "description": p.description}),
                        )
                    })
                    .collect();
                let required: Vec<&String> = spec.parameters.keys().collect();
                catalog.definitions.push(ToolDefinition::new(
                    name.clone(),
                    format!("{}: {}", descriptor.description_or_name(), spec.description),
                    json!({"type": "object", "properties": properties, "required": required}),
                    ToolCategory::DeviceIot,
                ));
                catalog.bindings.insert(
                    name.clone(),
                    IotBinding::Method {
                        device: descriptor.name.clone(),
                        method: method.clone(),
                    },
                );
                added.push(name);
            }
        }

        if !added.is_empty() {
            info!("Registered {} IoT tools", added.len());
        }
        added
    }

    /// Merge a `states` report from the device.
    pub fn update_states(&self, states: &[Value]) {
        let mut known = self.states.write();
        for raw in states {
            let Ok(update) = serde_json::from_value::<IotStateUpdate>(raw.clone()) else {
                continue;
            };
            known.entry(update.name).or_default().extend(update.state);
        }
        drop(known);
        self.updates.send_modify(|v| *v += 1);
    }

    pub fn state_of(&self, device: &str, property: &str) -> Option<Value> {
        self.states.read().get(device).and_then(|s| s.get(property).cloned())
    }

    fn binding(&self, name: &str) -> Option<IotBinding> {
        self.catalog.read().bindings.get(name).cloned()
    }

    async fn invoke_method(
        &self,
        ctx: &ToolContext,
        device: &str,
        method: &str,
        args: &ToolArgs,
    ) -> ToolResult<ToolOutput> {
        let mut updates = self.updates.subscribe();

        let command = json!({
            "type": "iot",
            "commands": [{"name": device, "method": method, "parameters": args_to_json(args)}],
        });
        ctx.send_to_device(command).await?;

        let confirmed = tokio::time::timeout(self.state_wait, updates.changed()).await;
        match confirmed {
            Ok(Ok(())) => {
                let state = self
                    .states
                    .read()
                    .get(device)
                    .map(|s| Value::Object(s.clone()))
                    .unwrap_or(Value::Null);
                Ok(ToolOutput::req_llm(format!("{}.{} 执行成功，当前状态: {}", device, method, state)))
            }
            _ => {
                debug!(session_id = %ctx.session_id, "No IoT state update after {}.{}", device, method);
                Ok(ToolOutput::req_llm(format!("{}.{} 指令已发送", device, method)))
            }
        }
    }
}

impl IotDescriptor {
    fn description_or_name(&self) -> &str {
        if self.description.is_empty() {
            &self.name
        } else {
            &self.description
        }
    }
}

#[async_trait]
impl ToolExecutor for IotExecutor {
    fn category(&self) -> ToolCategory {
        ToolCategory::DeviceIot
    }

    async fn execute(&self, ctx: &ToolContext, name: &str, args: &ToolArgs) -> ToolResult<ToolOutput> {
        match self.binding(name) {
            Some(IotBinding::Property { device, property }) => {
                let value = self.state_of(&device, &property);
                Ok(match value {
                    Some(v) => ToolOutput::req_llm(format!("{}的{}是{}", device, property, v)),
                    None => ToolOutput::req_llm(format!("{}的{}未知", device, property)),
                })
            }
            Some(IotBinding::Method { device, method }) => {
                self.invoke_method(ctx, &device, &method, args).await
            }
            None => Err(ToolError::NotFound(name.to_string())),
        }
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        self.catalog.read().definitions.clone()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.catalog.read().bindings.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::{DeviceChannel, ToolArg};
    use crate::core::types::SessionId;
    use parking_lot::Mutex;
    use std::sync::{Arc, Weak};

    fn speaker() -> Value {
        json!({
            "name": "Speaker",
            "description": "扬声器",
            "properties": {"volume": {"description": "当前音量", "type": "number"}},
            "methods": {"SetVolume": {"description": "设置音量",
                "parameters": {"volume": {"description": "0-100", "type": "number"}}}}
        })
    }

    struct RecordingDevice {
        sent: Mutex<Vec<Value>>,
        executor: Weak<IotExecutor>,
    }

    #[async_trait]
    impl DeviceChannel for RecordingDevice {
        async fn send_json(&self, message: Value) -> ToolResult<()> {
            self.sent.lock().push(message);
            if let Some(executor) = self.executor.upgrade() {
                executor.update_states(&[json!({"name": "Speaker", "state": {"volume": 30}})]);
            }
            Ok(())
        }
    }

    #[test]
    fn test_descriptor_builds_tools() {
        let iot = IotExecutor::new(Duration::from_millis(50));
        let added = iot.register_descriptors(&[speaker()]);
        assert_eq!(added, vec!["get_speaker_volume", "speaker_setvolume"]);
        assert!(iot.has_tool("get_speaker_volume"));
        // Re-registration does not duplicate
        assert!(iot.register_descriptors(&[speaker()]).is_empty());
        assert_eq!(iot.list_tools().len(), 2);
    }

    #[tokio::test]
    async fn test_property_reads_reported_state() {
        let iot = IotExecutor::new(Duration::from_millis(50));
        iot.register_descriptors(&[speaker()]);
        iot.update_states(&[json!({"name": "Speaker", "state": {"volume": 70}})]);
        let ctx = ToolContext::detached(SessionId::new());
        let out = iot.execute(&ctx, "get_speaker_volume", &ToolArgs::new()).await.unwrap();
        assert!(out.content.contains("70"));
    }

    #[tokio::test]
    async fn test_method_sends_command_and_waits_for_state() {
        let iot = Arc::new(IotExecutor::new(Duration::from_secs(1)));
        iot.register_descriptors(&[speaker()]);
        let device = Arc::new(RecordingDevice {
            sent: Mutex::new(Vec::new()),
            executor: Arc::downgrade(&iot),
        });
        let weak: Weak<dyn DeviceChannel> = Arc::downgrade(&device) as Weak<dyn DeviceChannel>;
        let ctx = ToolContext::new(SessionId::new(), "dev", weak);

        let mut args = ToolArgs::new();
        args.insert("volume".into(), ToolArg::Int(30));
        let out = iot.execute(&ctx, "speaker_setvolume", &args).await.unwrap();
        assert!(out.content.contains("执行成功"));

        let sent = device.sent.lock();
        assert_eq!(sent[0]["type"], "iot");
        assert_eq!(sent[0]["commands"][0]["method"], "SetVolume");
        assert_eq!(sent[0]["commands"][0]["parameters"]["volume"], 30);
    }

    #[tokio::test]
    async fn test_method_without_device_fails() {
        let iot = IotExecutor::new(Duration::from_millis(10));
        iot.register_descriptors(&[speaker()]);
        let ctx = ToolContext::detached(SessionId::new());
        let err = iot.execute(&ctx, "speaker_setvolume", &ToolArgs::new()).await.unwrap_err();
        assert_eq!(err, ToolError::DeviceUnavailable);
    }
}
