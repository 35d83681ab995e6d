//! Topic routing from the bus to handlers.
//!
//! The table is built once at startup. For every message the dispatch loop
//! walks the routes in order and awaits each matching handler; a failing
//! handler is logged and does not stop the loop.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, InvalidTopicPattern, TopicPattern};

type Handler = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Who is listening, to what, and whether remote messages are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub subscriber_id: String,
    pub topics: Vec<TopicPattern>,
    /// Ignore messages forwarded from other nodes.
    pub local_only: bool,
}

impl Subscription {
    pub fn new<I, S>(subscriber_id: impl Into<String>, topics: I) -> Result<Self, InvalidTopicPattern>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics = topics
            .into_iter()
            .map(|t| TopicPattern::parse(t.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            subscriber_id: subscriber_id.into(),
            topics,
            local_only: true,
        })
    }

    pub fn accepting_remote(mut self) -> Self {
        self.local_only = false;
        self
    }

    pub fn accepts(&self, message: &BusMessage) -> bool {
        (message.local || !self.local_only) && self.topics.iter().any(|t| t.matches(&message.topic))
    }
}

struct Route {
    name: &'static str,
    pattern: TopicPattern,
    handler: Handler,
}

/// Ordered `(pattern, handler)` routes for one subscriber.
///
/// ```ignore
/// let table = DispatchTable::new(subscription)
///     .route("/device/*/*/online", "buffer-state", move |msg| {
///         let buffer = buffer.clone();
///         async move { /* ... */ Ok(()) }
///     })?;
/// ```
pub struct DispatchTable {
    subscription: Subscription,
    routes: Vec<Route>,
}

impl DispatchTable {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            routes: Vec::new(),
        }
    }

    /// Add a route. Its pattern joins the subscription's topics.
    pub fn route<F, Fut>(
        mut self,
        pattern: &str,
        name: &'static str,
        handler: F,
    ) -> Result<Self, InvalidTopicPattern>
    where
        F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let pattern = TopicPattern::parse(pattern)?;
        if !self.subscription.topics.contains(&pattern) {
            self.subscription.topics.push(pattern.clone());
        }
        self.routes.push(Route {
            name,
            pattern,
            handler: Arc::new(move |message| -> BoxFuture<'static, Result<()>> {
                Box::pin(handler(message))
            }),
        });
        Ok(self)
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Run every matching handler for `message`. Returns how many ran.
    pub async fn dispatch(&self, message: BusMessage) -> usize {
        if !self.subscription.accepts(&message) {
            return 0;
        }

        let mut handled = 0;
        for route in &self.routes {
            if !route.pattern.matches(&message.topic) {
                continue;
            }
            handled += 1;
            if let Err(e) = (route.handler)(message.clone()).await {
                warn!(
                    route = route.name,
                    topic = %message.topic,
                    error = ?e,
                    "message handler failed"
                );
            }
        }
        handled
    }

    /// Consume `receiver` until cancelled or the bus closes.
    ///
    /// Cancellation also abandons a handler that is still running.
    pub async fn run(self, mut receiver: broadcast::Receiver<BusMessage>, cancel: CancellationToken) {
        info!(
            subscriber_id = %self.subscription.subscriber_id,
            routes = self.routes.len(),
            "dispatch loop started"
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv() => received,
            };

            match received {
                Ok(message) => {
                    // Handlers may wait on a full buffer; cancellation must still win.
                    let handled = tokio::select! {
                        _ = cancel.cancelled() => break,
                        handled = self.dispatch(message) => handled,
                    };
                    if handled == 0 {
                        debug!("message matched no route");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        subscriber_id = %self.subscription.subscriber_id,
                        skipped,
                        "dispatch loop lagged, messages dropped"
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }

        info!(subscriber_id = %self.subscription.subscriber_id, "dispatch loop stopped");
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("subscription", &self.subscription)
            .field(
                "routes",
                &self.routes.iter().map(|r| r.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeviceMessage, EventBus};
    use std::sync::Mutex;

    fn recording(
        table: DispatchTable,
        pattern: &str,
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    ) -> DispatchTable {
        table
            .route(pattern, name, move |message| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(format!("{name}:{}", message.message.device_id));
                    Ok::<_, anyhow::Error>(())
                }
            })
            .unwrap()
    }

    fn message(msg: DeviceMessage, local: bool) -> BusMessage {
        BusMessage {
            topic: msg.topic(),
            message: msg,
            local,
        }
    }

    #[tokio::test]
    async fn test_routes_by_topic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let table = DispatchTable::new(Subscription::new("test", Vec::<String>::new()).unwrap());
        let table = recording(table, "/device/*/*/online", "online", seen.clone());
        let table = recording(table, "/device/*/*/offline", "offline", seen.clone());

        assert_eq!(table.dispatch(message(DeviceMessage::online("p", "a"), true)).await, 1);
        assert_eq!(table.dispatch(message(DeviceMessage::offline("p", "b"), true)).await, 1);
        assert_eq!(
            table
                .dispatch(message(DeviceMessage::child_register("p", "gw", "c"), true))
                .await,
            0
        );

        assert_eq!(*seen.lock().unwrap(), vec!["online:a", "offline:b"]);
    }

    #[tokio::test]
    async fn test_local_only_ignores_remote_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let table = DispatchTable::new(Subscription::new("test", ["/device/**"]).unwrap());
        let table = recording(table, "/device/**", "all", seen.clone());

        assert_eq!(table.dispatch(message(DeviceMessage::online("p", "a"), false)).await, 0);
        assert!(seen.lock().unwrap().is_empty());

        let table = DispatchTable {
            subscription: table.subscription.clone().accepting_remote(),
            routes: table.routes,
        };
        assert_eq!(table.dispatch(message(DeviceMessage::online("p", "a"), false)).await, 1);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_other_routes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let table = DispatchTable::new(Subscription::new("test", Vec::<String>::new()).unwrap())
            .route("/device/**", "failing", |_| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .unwrap();
        let table = recording(table, "/device/**", "after", seen.clone());

        assert_eq!(table.dispatch(message(DeviceMessage::online("p", "a"), true)).await, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["after:a"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let table = DispatchTable::new(Subscription::new("test", Vec::<String>::new()).unwrap());
        let table = recording(table, "/device/*/*/online", "online", seen.clone());

        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(table.run(bus.subscribe(), cancel.clone()));

        bus.publish(DeviceMessage::online("p", "a"));
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while seen.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_abandons_stuck_handler() {
        let started = Arc::new(tokio::sync::Notify::new());
        let table = DispatchTable::new(Subscription::new("test", Vec::<String>::new()).unwrap())
            .route("/device/**", "stuck", {
                let started = started.clone();
                move |_| {
                    let started = started.clone();
                    async move {
                        started.notify_one();
                        std::future::pending::<()>().await;
                        Ok::<_, anyhow::Error>(())
                    }
                }
            })
            .unwrap();

        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(table.run(bus.subscribe(), cancel.clone()));

        bus.publish(DeviceMessage::online("p", "a"));
        started.notified().await;

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_route_rejects_bad_pattern() {
        let table = DispatchTable::new(Subscription::new("test", Vec::<String>::new()).unwrap());
        assert!(table.route("no-slash", "bad", |_| async { Ok::<_, anyhow::Error>(()) }).is_err());
    }
}
