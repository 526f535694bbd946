//! Which local table replicates to which remote table.

use crate::store::{ChapterHistory, ChapterHistoryReplication, MdApi, MdApiReplication, Table};

/// Binding of one local table to one remote key-value table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Short name used in logs.
    pub name: String,
    pub local_table: String,
    /// Replication bookkeeping for `local_table`, keyed by the same ids.
    pub history_table: String,
    /// `meta` key holding the [`ReplicationCheckpoint`](crate::types::ReplicationCheckpoint).
    pub checkpoint_key: String,
    pub remote_table: String,
}

impl ReplicationConfig {
    fn for_tables<L: Table, H: Table>(remote_table: &str) -> Self {
        Self {
            name: L::NAME.to_string(),
            local_table: L::NAME.to_string(),
            history_table: H::NAME.to_string(),
            checkpoint_key: format!("{}_replication_checkpoint", L::NAME),
            remote_table: remote_table.to_string(),
        }
    }

    pub fn chapter_history() -> Self {
        Self::for_tables::<ChapterHistory, ChapterHistoryReplication>("mdt_chapter_history")
    }

    pub fn md_api() -> Self {
        Self::for_tables::<MdApi, MdApiReplication>("mdt_md_api")
    }

    /// Every table the tracker replicates.
    pub fn all() -> Vec<Self> {
        vec![Self::chapter_history(), Self::md_api()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let history = ReplicationConfig::chapter_history();
        assert_eq!(history.local_table, "chapter_history");
        assert_eq!(history.history_table, "chapter_history_replication_history");
        assert_eq!(history.checkpoint_key, "chapter_history_replication_checkpoint");
        assert_eq!(history.remote_table, "mdt_chapter_history");

        let api = ReplicationConfig::md_api();
        assert_eq!(api.history_table, "md_api_replication_history");
        assert_eq!(api.checkpoint_key, "md_api_replication_checkpoint");
        assert_eq!(api.remote_table, "mdt_md_api");
    }
}
