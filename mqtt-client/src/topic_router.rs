// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::{Arc, RwLock};

use codec::QoS;
use tokio::sync::mpsc;

use crate::options::DispatchOrder;

/// An inbound publication handed to a subscriber's handler.
#[derive(Clone, Debug)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;

struct Route {
    filter: String,
    handler: Handler,
}

/// Matches inbound topics against active subscription filters and dispatches to
/// handlers, either concurrently (default) or ordered per-QoS-class.
pub struct TopicRouter {
    routes: RwLock<Vec<Route>>,
    order: DispatchOrder,
    ordered_queues: Option<[mpsc::UnboundedSender<(Handler, Message)>; 3]>,
}

impl TopicRouter {
    #[must_use]
    pub fn new(order: DispatchOrder) -> Self {
        let ordered_queues = match order {
            DispatchOrder::Unordered => None,
            DispatchOrder::Ordered => Some(std::array::from_fn(|_| {
                let (tx, mut rx) = mpsc::unbounded_channel::<(Handler, Message)>();
                tokio::spawn(async move {
                    while let Some((handler, message)) = rx.recv().await {
                        invoke(&handler, message);
                    }
                });
                tx
            })),
        };
        TopicRouter {
            routes: RwLock::new(Vec::new()),
            order,
            ordered_queues,
        }
    }

    /// Registers a handler for `filter`. Synchronous with the SUBSCRIBE submission so
    /// publications arriving right after SUBACK always find the route.
    pub fn add_route(&self, filter: &str, handler: Handler) {
        self.routes.write().unwrap().push(Route {
            filter: filter.to_string(),
            handler,
        });
    }

    /// Removes every route registered for `filter`.
    pub fn remove_route(&self, filter: &str) {
        self.routes.write().unwrap().retain(|r| r.filter != filter);
    }

    fn matching_handlers(&self, topic: &str) -> Vec<Handler> {
        self.routes
            .read()
            .unwrap()
            .iter()
            .filter(|r| topic_matches(&r.filter, topic))
            .map(|r| Arc::clone(&r.handler))
            .collect()
    }

    /// Dispatches `message` to every route whose filter matches its topic.
    pub fn dispatch(&self, message: Message) {
        let handlers = self.matching_handlers(&message.topic);
        match &self.ordered_queues {
            None => {
                for handler in handlers {
                    let message = message.clone();
                    tokio::spawn(async move {
                        invoke(&handler, message);
                    });
                }
            }
            Some(queues) => {
                let queue = &queues[message.qos as usize];
                for handler in handlers {
                    if queue.send((handler, message.clone())).is_err() {
                        log::error!("topic_router: ordered dispatch queue closed");
                    }
                }
            }
        }
    }

    #[must_use]
    pub const fn order(&self) -> DispatchOrder {
        self.order
    }
}

fn invoke(handler: &Handler, message: Message) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(message)));
    if let Err(panic) = result {
        log::error!("topic_router: subscriber handler panicked: {panic:?}");
    }
}

/// MQTT wildcard matching: `+` matches exactly one level, `#` matches zero or more
/// trailing levels and must be the final token. Filters/topics starting with `$` are
/// never matched by a wildcard at the first level [MQTT-4.7.2-1].
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let first_filter_level = filter.split('/').next().unwrap_or("");
    if (first_filter_level == "+" || first_filter_level == "#") && topic.starts_with('$') {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) => {
                if f != t {
                    return false;
                }
            }
            (Some(_), None) | (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/d"));
    }

    #[test]
    fn plus_matches_one_level() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/c/d"));
        assert!(!topic_matches("a/+", "$SYS/b"));
    }

    #[test]
    fn hash_matches_trailing_levels() {
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "a/b/c"));
        assert!(!topic_matches("#", "$SYS/stats"));
    }

    #[tokio::test]
    async fn dispatch_invokes_matching_handlers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let router = TopicRouter::new(DispatchOrder::Unordered);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        router.add_route(
            "a/+",
            Arc::new(move |_msg| {
                counter2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        router.dispatch(Message {
            topic: "a/b".to_string(),
            payload: vec![],
            qos: QoS::AtMostOnce,
            retain: false,
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
