//! Insertion-ordered registries for tools, prompts, resources, and templates
//!
//! Each collection maps a unique key to a descriptor/handler pair. Handlers
//! are trait objects so user code can supply anything from a closure to a
//! stateful service; the `*_fn` adapters cover the closure case.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::context::RequestContext;
use crate::errors::ServerError;
use crate::protocol::types::{
    CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, Prompt, ReadResourceParams,
    ReadResourceResult, Resource, ResourceTemplate, Tool,
};
use crate::protocol::uri_template::UriTemplate;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        ctx: RequestContext,
        params: CallToolParams,
    ) -> Result<CallToolResult, ServerError>;
}

#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn get(
        &self,
        ctx: RequestContext,
        params: GetPromptParams,
    ) -> Result<GetPromptResult, ServerError>;
}

/// Serves `resources/read` for a concrete resource or a template. For
/// template registrations the dispatcher performs the match and passes the
/// resolved URI in the request.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(
        &self,
        ctx: RequestContext,
        params: ReadResourceParams,
    ) -> Result<ReadResourceResult, ServerError>;
}

struct FnToolHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnToolHandler<F>
where
    F: Fn(RequestContext, CallToolParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallToolResult, ServerError>> + Send,
{
    async fn call(
        &self,
        ctx: RequestContext,
        params: CallToolParams,
    ) -> Result<CallToolResult, ServerError> {
        (self.0)(ctx, params).await
    }
}

struct FnPromptHandler<F>(F);

#[async_trait]
impl<F, Fut> PromptHandler for FnPromptHandler<F>
where
    F: Fn(RequestContext, GetPromptParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<GetPromptResult, ServerError>> + Send,
{
    async fn get(
        &self,
        ctx: RequestContext,
        params: GetPromptParams,
    ) -> Result<GetPromptResult, ServerError> {
        (self.0)(ctx, params).await
    }
}

struct FnResourceHandler<F>(F);

#[async_trait]
impl<F, Fut> ResourceHandler for FnResourceHandler<F>
where
    F: Fn(RequestContext, ReadResourceParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ReadResourceResult, ServerError>> + Send,
{
    async fn read(
        &self,
        ctx: RequestContext,
        params: ReadResourceParams,
    ) -> Result<ReadResourceResult, ServerError> {
        (self.0)(ctx, params).await
    }
}

pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(RequestContext, CallToolParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CallToolResult, ServerError>> + Send + 'static,
{
    Arc::new(FnToolHandler(f))
}

pub fn prompt_fn<F, Fut>(f: F) -> Arc<dyn PromptHandler>
where
    F: Fn(RequestContext, GetPromptParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GetPromptResult, ServerError>> + Send + 'static,
{
    Arc::new(FnPromptHandler(f))
}

pub fn resource_fn<F, Fut>(f: F) -> Arc<dyn ResourceHandler>
where
    F: Fn(RequestContext, ReadResourceParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReadResourceResult, ServerError>> + Send + 'static,
{
    Arc::new(FnResourceHandler(f))
}

/// Small map that remembers first-registration order. Replacing a value
/// keeps its original position; collections stay small enough that linear
/// scans beat hashing.
struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> OrderedMap<V> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn insert(&mut self, key: &str, value: V) {
        match self.entries.iter().position(|(k, _)| k == key) {
            Some(at) => self.entries[at].1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let at = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(at).1)
    }

    fn get(&self, key: &str) -> Option<&V> {
        self.entries
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }
}

struct ToolEntry {
    tool: Tool,
    handler: Arc<dyn ToolHandler>,
}

struct PromptEntry {
    prompt: Prompt,
    handler: Arc<dyn PromptHandler>,
}

struct ResourceEntry {
    resource: Resource,
    handler: Arc<dyn ResourceHandler>,
}

struct TemplateEntry {
    descriptor: ResourceTemplate,
    template: UriTemplate,
    handler: Arc<dyn ResourceHandler>,
}

/// The four registry collections. Mutations are observable atomically: an
/// entry is fully inserted or removed before any notification about it is
/// broadcast.
pub struct Registry {
    tools: RwLock<OrderedMap<ToolEntry>>,
    prompts: RwLock<OrderedMap<PromptEntry>>,
    resources: RwLock<OrderedMap<ResourceEntry>>,
    templates: RwLock<OrderedMap<TemplateEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(OrderedMap::new()),
            prompts: RwLock::new(OrderedMap::new()),
            resources: RwLock::new(OrderedMap::new()),
            templates: RwLock::new(OrderedMap::new()),
        }
    }

    pub fn register_tool(&self, tool: Tool, handler: Arc<dyn ToolHandler>) {
        let name = tool.name.clone();
        self.tools.write().insert(&name, ToolEntry { tool, handler });
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        self.tools.read().values().map(|e| e.tool.clone()).collect()
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.read().get(name).map(|e| e.handler.clone())
    }

    pub fn register_prompt(&self, prompt: Prompt, handler: Arc<dyn PromptHandler>) {
        let name = prompt.name.clone();
        self.prompts
            .write()
            .insert(&name, PromptEntry { prompt, handler });
    }

    pub fn unregister_prompt(&self, name: &str) -> bool {
        self.prompts.write().remove(name).is_some()
    }

    pub fn list_prompts(&self) -> Vec<Prompt> {
        self.prompts
            .read()
            .values()
            .map(|e| e.prompt.clone())
            .collect()
    }

    pub fn get_prompt(&self, name: &str) -> Option<Arc<dyn PromptHandler>> {
        self.prompts.read().get(name).map(|e| e.handler.clone())
    }

    pub fn register_resource(&self, resource: Resource, handler: Arc<dyn ResourceHandler>) {
        let uri = resource.uri.clone();
        self.resources
            .write()
            .insert(&uri, ResourceEntry { resource, handler });
    }

    pub fn unregister_resource(&self, uri: &str) -> bool {
        self.resources.write().remove(uri).is_some()
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.resources
            .read()
            .values()
            .map(|e| e.resource.clone())
            .collect()
    }

    /// Validates the template string before storing; a malformed template
    /// fails the call without mutating the collection.
    pub fn register_resource_template(
        &self,
        descriptor: ResourceTemplate,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<(), ServerError> {
        let template = UriTemplate::parse(&descriptor.uri_template)?;
        let key = descriptor.uri_template.clone();
        self.templates.write().insert(
            &key,
            TemplateEntry {
                descriptor,
                template,
                handler,
            },
        );
        Ok(())
    }

    pub fn unregister_resource_template(&self, uri_template: &str) -> bool {
        self.templates.write().remove(uri_template).is_some()
    }

    pub fn list_resource_templates(&self) -> Vec<ResourceTemplate> {
        self.templates
            .read()
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Resolves a `resources/read` URI: the exact-URI map wins, then
    /// templates are tried in registration order and the first match wins.
    pub fn resolve_resource(&self, uri: &str) -> Option<Arc<dyn ResourceHandler>> {
        if let Some(entry) = self.resources.read().get(uri) {
            return Some(entry.handler.clone());
        }
        self.templates
            .read()
            .values()
            .find(|entry| entry.template.match_uri(uri).is_some())
            .map(|entry| entry.handler.clone())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{Content, ResourceContents};
    use serde_json::json;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }
    }

    fn noop_resource_handler() -> Arc<dyn ResourceHandler> {
        resource_fn(|_ctx, params| async move {
            Ok(ReadResourceResult {
                contents: vec![ResourceContents::Text {
                    uri: params.uri,
                    mime_type: None,
                    text: String::new(),
                }],
            })
        })
    }

    fn echo_tool_handler() -> Arc<dyn ToolHandler> {
        tool_fn(|_ctx, params: CallToolParams| async move {
            let text = params
                .arguments
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(CallToolResult {
                content: vec![Content::text(text)],
                is_error: None,
            })
        })
    }

    #[test]
    fn listing_preserves_registration_order() {
        let registry = Registry::new();
        registry.register_tool(tool("b"), echo_tool_handler());
        registry.register_tool(tool("a"), echo_tool_handler());
        registry.register_tool(tool("c"), echo_tool_handler());

        let names: Vec<_> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn reregistering_replaces_in_place() {
        let registry = Registry::new();
        registry.register_tool(tool("a"), echo_tool_handler());
        registry.register_tool(tool("b"), echo_tool_handler());
        registry.register_tool(
            Tool {
                description: Some("replaced".into()),
                ..tool("a")
            },
            echo_tool_handler(),
        );

        let tools = registry.list_tools();
        assert_eq!(tools[0].name, "a");
        assert_eq!(tools[0].description.as_deref(), Some("replaced"));
        assert_eq!(tools.len(), 2);
    }

    #[test]
    fn unregister_reports_whether_anything_was_removed() {
        let registry = Registry::new();
        registry.register_tool(tool("a"), echo_tool_handler());
        assert!(registry.unregister_tool("a"));
        assert!(!registry.unregister_tool("a"));
        assert!(registry.list_tools().is_empty());
    }

    #[test]
    fn malformed_template_fails_without_mutating_state() {
        let registry = Registry::new();
        let err = registry
            .register_resource_template(
                ResourceTemplate {
                    uri_template: "file:///{broken".into(),
                    name: "broken".into(),
                    description: None,
                    mime_type: None,
                },
                noop_resource_handler(),
            )
            .expect_err("malformed template");
        assert_eq!(err.jsonrpc_code(), crate::errors::CODE_INVALID_PARAMS);
        assert!(registry.list_resource_templates().is_empty());
    }

    #[test]
    fn exact_uri_wins_over_template_match() {
        let registry = Registry::new();
        registry
            .register_resource_template(
                ResourceTemplate {
                    uri_template: "file:///{name}".into(),
                    name: "any file".into(),
                    description: None,
                    mime_type: None,
                },
                noop_resource_handler(),
            )
            .expect("template");
        let exact = noop_resource_handler();
        registry.register_resource(
            Resource {
                uri: "file:///known".into(),
                name: "known".into(),
                description: None,
                mime_type: None,
            },
            exact.clone(),
        );

        let resolved = registry.resolve_resource("file:///known").expect("exact");
        assert!(Arc::ptr_eq(&resolved, &exact));
        assert!(registry.resolve_resource("file:///other").is_some());
        assert!(registry.resolve_resource("nope://x").is_none());
    }

    #[test]
    fn first_matching_template_wins() {
        let registry = Registry::new();
        let first = noop_resource_handler();
        let second = noop_resource_handler();
        registry
            .register_resource_template(
                ResourceTemplate {
                    uri_template: "file:///{a}".into(),
                    name: "first".into(),
                    description: None,
                    mime_type: None,
                },
                first.clone(),
            )
            .expect("first template");
        registry
            .register_resource_template(
                ResourceTemplate {
                    uri_template: "file:///{b}".into(),
                    name: "second".into(),
                    description: None,
                    mime_type: None,
                },
                second,
            )
            .expect("second template");

        let resolved = registry.resolve_resource("file:///x").expect("match");
        assert!(Arc::ptr_eq(&resolved, &first));
    }
}
