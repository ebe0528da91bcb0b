/// The KV store key for a job's result payload
pub fn result_key(namespace: &str, id: &str) -> String {
    format!("{}:{}", namespace, id)
}

/// The KV store key for a job's status record
pub fn status_key(namespace: &str, id: &str) -> String {
    format!("{}:{}:status", namespace, id)
}

/// Prefix covering every result and status key of a namespace
pub fn namespace_prefix(namespace: &str) -> String {
    format!("{}:", namespace)
}

/// Key of an admission lock
pub fn lock_key(name: &str) -> String {
    format!("locks/{}", name)
}

/// Key of a service health record
pub fn health_key(service: &str) -> String {
    format!("health/{}", service)
}

pub const HEALTH_PREFIX: &str = "health/";

/// Construct the key for a task record, ordered by ready time then enqueue sequence.
pub fn task_key(queue: &str, ready_at_ms: i64, seq: u64, task_id: &str) -> String {
    // Zero-pad so lexicographic order is time asc, then sequence asc
    format!(
        "tasks/{}/{:020}/{:020}/{}",
        queue,
        ready_at_ms.max(0) as u64,
        seq,
        task_id
    )
}

/// Prefix covering every task record of a queue
pub fn task_queue_prefix(queue: &str) -> String {
    format!("tasks/{}/", queue)
}

pub const CLAIM_PREFIX: &str = "claims/";

/// Key of a worker's claim on a task
pub fn claim_key(task_id: &str) -> String {
    format!("{}{}", CLAIM_PREFIX, task_id)
}

/// Parsed components of a task key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTaskKey {
    pub queue: String,
    pub ready_at_ms: i64,
    pub seq: u64,
    pub task_id: String,
}

pub fn parse_task_key(key: &str) -> Option<ParsedTaskKey> {
    let rest = key.strip_prefix("tasks/")?;
    let mut parts = rest.split('/');
    let queue = parts.next()?.to_string();
    let ready_at_ms = parts.next()?.parse::<u64>().ok()? as i64;
    let seq = parts.next()?.parse::<u64>().ok()?;
    let task_id = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }
    Some(ParsedTaskKey {
        queue,
        ready_at_ms,
        seq,
        task_id,
    })
}
