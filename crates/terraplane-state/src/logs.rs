//! Executor log lines, persisted per scope (a deployment id or a project's
//! refresh scope) and read back in write order.

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::*;

impl StateStore {
    /// Append a batch of lines to `scope` in one transaction.
    pub fn append_logs(&self, scope: &str, lines: &[(LogStream, String)]) -> StateResult<usize> {
        if lines.is_empty() {
            return Ok(0);
        }
        let counter = format!("log:{scope}");
        self.write(|txn| -> StateResult<usize> {
            let timestamp = epoch_secs();
            for (stream, line) in lines {
                let record = LogLine {
                    scope: scope.to_string(),
                    seq: txn.next_sequence(&counter)?,
                    stream: *stream,
                    line: line.clone(),
                    timestamp,
                };
                txn.put(&record)?;
            }
            Ok(lines.len())
        })
    }

    pub fn list_logs(&self, scope: &str) -> StateResult<Vec<LogLine>> {
        self.list_prefix(&format!("{scope}#"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_keep_order_across_batches() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_logs("d1", &[(LogStream::Stdout, "init".to_string())])
            .unwrap();
        store
            .append_logs(
                "d1",
                &[
                    (LogStream::Stdout, "plan".to_string()),
                    (LogStream::Stderr, "warning".to_string()),
                ],
            )
            .unwrap();
        store
            .append_logs("d10", &[(LogStream::Stdout, "other".to_string())])
            .unwrap();

        let lines: Vec<String> = store
            .list_logs("d1")
            .unwrap()
            .into_iter()
            .map(|l| l.line)
            .collect();
        assert_eq!(lines, vec!["init", "plan", "warning"]);
    }

    #[test]
    fn empty_batch_is_noop() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.append_logs("d1", &[]).unwrap(), 0);
        assert!(store.list_logs("d1").unwrap().is_empty());
    }
}
