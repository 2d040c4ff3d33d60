//! Routing - task 名からキューと priority を決める
//!
//! 優先順位: signature の `queue` > ルーティングテーブル > task の既定キュー >
//! `default_queue`。テーブルは定義順に評価し、最初に一致したものを使います。

use super::config::{AppConfig, RouteConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub queue: String,
    pub priority: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<RouteConfig>,
    default_queue: String,
}

impl Router {
    pub fn new(rules: Vec<RouteConfig>, default_queue: impl Into<String>) -> Self {
        Self {
            rules,
            default_queue: default_queue.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.routes.clone(), config.default_queue.clone())
    }

    /// Route for `task`. `task_queue` is the task's registered default queue,
    /// if the caller knows it.
    pub fn route(&self, task: &str, task_queue: Option<&str>) -> Route {
        if let Some(rule) = self.rules.iter().find(|r| matches(&r.pattern, task)) {
            return Route {
                queue: rule.queue.clone(),
                priority: rule.priority,
            };
        }
        Route {
            queue: task_queue.unwrap_or(&self.default_queue).to_string(),
            priority: None,
        }
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }
}

/// Glob match where `*` matches any run of characters (including none).
fn matches(pattern: &str, name: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return false;
    };
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // no wildcard: exact match
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
