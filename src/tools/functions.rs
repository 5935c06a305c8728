use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ToolError,
    tools::{Capability, ToolHost},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: super::empty_object_schema(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    /// Parameter schema generated from a Rust type.
    pub fn with_parameters_of<T: JsonSchema>(self) -> Self {
        self.with_parameters(json_schema_for::<T>())
    }

    pub fn add_parameter(&mut self, parameter: FunctionParameter) {
        let FunctionParameter {
            name,
            mut schema,
            description,
            required,
            default,
        } = parameter;

        if let Some(object) = schema.as_object_mut() {
            if let Some(description) = description {
                object.insert("description".to_string(), Value::String(description));
            }
            if let Some(default) = default {
                object.insert("default".to_string(), default);
            }
        }

        let Some(root) = self.parameters.as_object_mut() else {
            return;
        };
        if required {
            let list = root
                .entry("required")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(list) = list.as_array_mut() {
                list.push(Value::String(name.clone()));
            }
        }
        let properties = root
            .entry("properties")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(properties) = properties.as_object_mut() {
            properties.insert(name, schema);
        }
    }

    pub fn to_capability(&self) -> Capability {
        Capability {
            name: self.name.clone(),
            description: self.description.clone(),
            parameter_schema: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionParameter {
    pub name: String,
    pub schema: Value,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<Value>,
}

impl FunctionParameter {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            description: None,
            required: true,
            default: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[async_trait]
pub trait KernelFunction: Send + Sync {
    fn definition(&self) -> FunctionDefinition;

    async fn invoke(&self, arguments: &Value) -> Result<Value, ToolError>;
}

pub type DynKernelFunction = Arc<dyn KernelFunction>;

type BoxedHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync>;

/// Adapts an async closure into a [`KernelFunction`].
pub struct ClosureFunction {
    definition: FunctionDefinition,
    handler: BoxedHandler,
}

impl ClosureFunction {
    pub fn new<F, Fut>(definition: FunctionDefinition, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            definition,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

#[async_trait]
impl KernelFunction for ClosureFunction {
    fn definition(&self) -> FunctionDefinition {
        self.definition.clone()
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, ToolError> {
        (self.handler)(arguments.clone())
            .await
            .map_err(|message| ToolError::Execution {
                capability: self.definition.name.clone(),
                message,
            })
    }
}

#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, DynKernelFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function: DynKernelFunction) {
        let name = function.definition().name;
        self.functions.insert(name, function);
    }

    pub fn register_fn<F, Fut>(&mut self, definition: FunctionDefinition, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.register(Arc::new(ClosureFunction::new(definition, handler)));
    }

    pub fn get(&self, name: &str) -> Option<&DynKernelFunction> {
        self.functions.get(name)
    }

    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.functions
            .values()
            .map(|function| function.definition())
            .collect()
    }

    pub async fn invoke(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        let function = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownCapability(name.to_string()))?;
        function.invoke(arguments).await
    }
}

/// Serves a [`FunctionRegistry`] as a tool host.
#[derive(Clone)]
pub struct FunctionToolHost {
    registry: Arc<FunctionRegistry>,
}

impl FunctionToolHost {
    pub fn new(registry: FunctionRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

#[async_trait]
impl ToolHost for FunctionToolHost {
    async fn list_capabilities(&self) -> Result<Vec<Capability>, ToolError> {
        Ok(self
            .registry
            .definitions()
            .iter()
            .map(FunctionDefinition::to_capability)
            .collect())
    }

    async fn invoke(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        self.registry.invoke(name, arguments).await
    }
}

pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema.schema).unwrap_or_else(|_| super::empty_object_schema())
}
