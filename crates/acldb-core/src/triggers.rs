//! Mutation triggers.
//!
//! Triggers run around saves and deletes of a class. All triggers of one
//! mutation call share a single [`TriggerContext`]: a before trigger may
//! edit the in-flight object or leave values in `context` for the matching
//! after trigger. After triggers only run when the mutation took effect.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use acldb_proto::{ObjectRecord, Value};

use crate::error::Result;
use crate::security::AclContext;

/// When a trigger runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerEvent {
    BeforeSave,
    AfterSave,
    BeforeDelete,
    AfterDelete,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::BeforeSave => "beforeSave",
            TriggerEvent::AfterSave => "afterSave",
            TriggerEvent::BeforeDelete => "beforeDelete",
            TriggerEvent::AfterDelete => "afterDelete",
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State handed to every trigger of one mutation call.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub event: TriggerEvent,
    pub class_name: String,
    /// Stored image before the mutation; `None` for inserts.
    pub original: Option<ObjectRecord>,
    /// Image being written, or the deleted row for delete events.
    pub object: Option<ObjectRecord>,
    /// Scratch values shared between the before and after triggers.
    pub context: BTreeMap<String, Value>,
    pub user_id: Option<String>,
    pub master: bool,
}

impl TriggerContext {
    pub fn new(event: TriggerEvent, class_name: impl Into<String>, acl: &AclContext) -> Self {
        Self {
            event,
            class_name: class_name.into(),
            original: None,
            object: None,
            context: BTreeMap::new(),
            user_id: acl.user_id().map(str::to_string),
            master: acl.is_master(),
        }
    }

    pub fn with_original(mut self, original: Option<ObjectRecord>) -> Self {
        self.original = original;
        self
    }

    pub fn with_object(mut self, object: Option<ObjectRecord>) -> Self {
        self.object = object;
        self
    }

    /// Move on to the next event of the same call, keeping `context`.
    pub fn advance(&mut self, event: TriggerEvent) {
        self.event = event;
    }
}

/// A callback run around mutations. Returning an error aborts the mutation.
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn call(&self, ctx: &mut TriggerContext) -> Result<()>;
}

/// Adapts a synchronous closure to [`Trigger`].
pub struct FnTrigger<F>(F);

#[async_trait]
impl<F> Trigger for FnTrigger<F>
where
    F: Fn(&mut TriggerContext) -> Result<()> + Send + Sync,
{
    async fn call(&self, ctx: &mut TriggerContext) -> Result<()> {
        (self.0)(ctx)
    }
}

/// Wrap a closure as a shareable trigger.
pub fn trigger_fn<F>(f: F) -> Arc<dyn Trigger>
where
    F: Fn(&mut TriggerContext) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnTrigger(f))
}

/// Triggers keyed by class and event, run in registration order.
#[derive(Default, Clone)]
pub struct TriggerRegistry {
    triggers: HashMap<(String, TriggerEvent), Vec<Arc<dyn Trigger>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class_name: impl Into<String>, event: TriggerEvent, trigger: Arc<dyn Trigger>) {
        self.triggers
            .entry((class_name.into(), event))
            .or_default()
            .push(trigger);
    }

    /// Check if any trigger is registered for the class.
    pub fn has_any(&self, class_name: &str) -> bool {
        self.triggers
            .iter()
            .any(|((class, _), triggers)| class == class_name && !triggers.is_empty())
    }

    fn for_event(&self, class_name: &str, event: TriggerEvent) -> Vec<Arc<dyn Trigger>> {
        self.triggers
            .get(&(class_name.to_string(), event))
            .cloned()
            .unwrap_or_default()
    }

    /// Run the triggers registered for `ctx.event`.
    pub async fn run(&self, ctx: &mut TriggerContext) -> Result<()> {
        for trigger in self.for_event(&ctx.class_name, ctx.event) {
            if let Err(e) = trigger.call(ctx).await {
                tracing::warn!(class = %ctx.class_name, event = %ctx.event, error = %e, "trigger failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("registered", &self.triggers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_context_is_shared_across_events() {
        let mut registry = TriggerRegistry::new();
        registry.register(
            "Post",
            TriggerEvent::BeforeSave,
            trigger_fn(|ctx| {
                ctx.context.insert("seen".into(), Value::Bool(true));
                if let Some(object) = ctx.object.as_mut() {
                    object.attributes.insert("slug".into(), Value::from("hello"));
                }
                Ok(())
            }),
        );
        registry.register(
            "Post",
            TriggerEvent::AfterSave,
            trigger_fn(|ctx| match ctx.context.get("seen") {
                Some(Value::Bool(true)) => Ok(()),
                _ => Err(Error::Trigger("context lost".into())),
            }),
        );
        assert!(registry.has_any("Post"));
        assert!(!registry.has_any("Comment"));

        let acl = AclContext::anonymous();
        let mut ctx = TriggerContext::new(TriggerEvent::BeforeSave, "Post", &acl)
            .with_object(Some(ObjectRecord::new("Post", "p")));
        registry.run(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.object.as_ref().unwrap().attributes["slug"],
            Value::from("hello")
        );
        ctx.advance(TriggerEvent::AfterSave);
        registry.run(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let mut registry = TriggerRegistry::new();
        registry.register(
            "Post",
            TriggerEvent::BeforeDelete,
            trigger_fn(|_| Err(Error::Trigger("locked".into()))),
        );
        let acl = AclContext::master();
        let mut ctx = TriggerContext::new(TriggerEvent::BeforeDelete, "Post", &acl);
        assert!(matches!(registry.run(&mut ctx).await, Err(Error::Trigger(_))));
    }
}
