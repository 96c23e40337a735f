/// Request handler abstractions and registration methods
use super::core::HostBridge;
use crate::error::HandlerError;
use crate::message::{Command, RequestMessage, Uid};
use crate::transport::FrameId;
use async_trait::async_trait;
use compact_str::CompactString;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// What a handler returns: the reply's `result`, or a failure that the
/// dispatcher turns into a notification plus an undefined result.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// Who sent the request being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// The frame the reply will be posted back to
    pub frame: FrameId,
    /// Correlation id of the request
    pub uid: Uid,
}

/// Host-resident function bound to one request tag.
///
/// Most code never implements this directly; [`HostBridge::register`] wraps a
/// closure over the raw request and [`HostBridge::register_command`] wraps a
/// closure over a typed [`Command`].
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static + Debug {
    async fn handle(&self, ctx: RequestContext, request: RequestMessage) -> HandlerResult;

    /// Human-readable name for logs.
    fn handler_name(&self) -> &str;
}

/// Handler over the raw request payload.
pub struct FnHandler<F> {
    name: String,
    handler: F,
}

impl<F> Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(RequestContext, RequestMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, request: RequestMessage) -> HandlerResult {
        (self.handler)(ctx, request).await
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// Handler that decodes the payload into a [`Command`] first.
///
/// A payload that does not decode is a handler failure, not an unknown
/// request: the tag was recognized, so the caller still gets its reply.
pub struct CommandHandler<C, F> {
    handler: F,
    _phantom: PhantomData<fn() -> C>,
}

impl<C, F> Debug for CommandHandler<C, F>
where
    C: Command,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler").field("tag", &C::TAG).finish()
    }
}

#[async_trait]
impl<C, F, Fut> RequestHandler for CommandHandler<C, F>
where
    C: Command,
    F: Fn(RequestContext, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C::Output, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, request: RequestMessage) -> HandlerResult {
        let command: C = request.decode()?;
        let output = (self.handler)(ctx, command).await?;
        match serde_json::to_value(output)? {
            // Unit outputs travel as an absent result, same as a handler that
            // returned nothing.
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    fn handler_name(&self) -> &str {
        C::TAG
    }
}

impl HostBridge {
    /// Binds `handler` to `request`. Last write wins: a previous handler for
    /// the same tag is replaced and returned.
    pub fn register_handler(
        &self,
        request: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Option<Arc<dyn RequestHandler>> {
        let previous = self.handlers.insert(CompactString::new(request), handler);
        if previous.is_some() {
            debug!("Replaced handler for request '{}'", request);
        } else {
            debug!("Registered handler for request '{}'", request);
        }
        previous
    }

    /// Registers a closure over the raw request.
    ///
    /// ```rust,no_run
    /// use frame_bridge::HostBridge;
    /// use serde_json::json;
    ///
    /// let bridge = HostBridge::with_defaults();
    /// bridge.register("getX", |_ctx, _request| async move { Ok(Some(json!(5))) });
    /// ```
    pub fn register<F, Fut>(&self, request: &str, handler: F) -> Option<Arc<dyn RequestHandler>>
    where
        F: Fn(RequestContext, RequestMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(
            request,
            Arc::new(FnHandler {
                name: request.to_string(),
                handler,
            }),
        )
    }

    /// Registers a typed handler under `C::TAG`.
    pub fn register_command<C, F, Fut>(&self, handler: F) -> Option<Arc<dyn RequestHandler>>
    where
        C: Command,
        F: Fn(RequestContext, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Output, HandlerError>> + Send + 'static,
    {
        self.register_handler(
            C::TAG,
            Arc::new(CommandHandler::<C, F> {
                handler,
                _phantom: PhantomData,
            }),
        )
    }

    pub fn has_handler(&self, request: &str) -> bool {
        self.handlers.contains_key(request)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Registered request tags, sorted.
    pub fn registered_requests(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.handlers.iter().map(|entry| entry.key().to_string()).collect();
        tags.sort();
        tags
    }

    /// Drops every handler. Only used on shutdown; handlers otherwise live as
    /// long as the bridge.
    pub(crate) fn clear_handlers(&self) {
        let count = self.handlers.len();
        self.handlers.clear();
        info!("🧹 Cleared {} request handler(s)", count);
    }
}
