//! Application schema: task-type names mapped to async handlers.
//!
//! The key set is the authoritative list of request types a server accepts.
//! Handlers take the opaque request payload and resolve to a reply payload
//! or a wire error. `task_fn` layers serde on both sides for typed call
//! sites; no runtime method synthesis happens anywhere.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use palaverproto::{WireError, PING_TASK};

/// Terminal handler stored in the schema.
pub type TaskHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, WireError>> + Send + Sync>;

/// Immutable task-type → handler map.
#[derive(Clone, Default)]
pub struct Schema {
    tasks: HashMap<String, TaskHandler>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn get(&self, task: &str) -> Option<&TaskHandler> {
        self.tasks.get(task)
    }

    pub fn contains(&self, task: &str) -> bool {
        self.tasks.contains_key(task)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.task_names().collect();
        names.sort_unstable();
        f.debug_struct("Schema").field("tasks", &names).finish()
    }
}

#[derive(Default)]
pub struct SchemaBuilder {
    tasks: HashMap<String, TaskHandler>,
}

impl SchemaBuilder {
    /// Register a handler for `task`.
    ///
    /// Panics when given the reserved healthcheck type; that one is wired
    /// through the server's healthcheck function instead.
    pub fn task<F, Fut>(mut self, task: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WireError>> + Send + 'static,
    {
        let task = task.into();
        assert_ne!(
            task, PING_TASK,
            "{PING_TASK} is reserved; configure a healthcheck on the server"
        );
        self.tasks
            .insert(task, Arc::new(move |payload| Box::pin(handler(payload))));
        self
    }

    /// Register a typed handler: the payload is deserialized into `Req`,
    /// the response serialized from `Resp`. A payload that does not fit
    /// `Req` fails the request with a code-400 error.
    pub fn task_fn<Req, Resp, F, Fut>(self, task: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, WireError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.task(task, move |payload| {
            let handler = handler.clone();
            async move {
                let request: Req = serde_json::from_value(payload)
                    .map_err(|e| WireError::new(format!("invalid payload: {e}")).with_code(400))?;
                let response = handler(request).await?;
                serde_json::to_value(response)
                    .map_err(|e| WireError::new(format!("unserializable response: {e}")))
            }
        })
    }

    pub fn build(self) -> Schema {
        Schema { tasks: self.tasks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    #[tokio::test]
    async fn untyped_handler_roundtrip() {
        let schema = Schema::builder()
            .task("ADD", |payload| async move {
                let x = payload["x"].as_i64().unwrap_or(0);
                let y = payload["y"].as_i64().unwrap_or(0);
                Ok(json!(x + y))
            })
            .build();

        assert!(schema.contains("ADD"));
        assert!(!schema.contains("SUB"));

        let handler = schema.get("ADD").unwrap();
        let out = handler(json!({"x": 3, "y": 5})).await.unwrap();
        assert_eq!(out, json!(8));
    }

    #[tokio::test]
    async fn typed_handler_deserializes_and_serializes() {
        #[derive(Deserialize)]
        struct AddArgs {
            x: i64,
            y: i64,
        }

        let schema = Schema::builder()
            .task_fn("ADD", |args: AddArgs| async move { Ok(args.x + args.y) })
            .build();

        let handler = schema.get("ADD").unwrap();
        assert_eq!(handler(json!({"x": 2, "y": 7})).await.unwrap(), json!(9));

        let err = handler(json!({"x": "two"})).await.unwrap_err();
        assert_eq!(err.code, Some(400));
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn ping_task_is_reserved() {
        let _ = Schema::builder().task(PING_TASK, |_| async move { Ok(Value::Null) });
    }
}
