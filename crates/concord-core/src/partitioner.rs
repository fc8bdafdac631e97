use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

/// Index into the database's ordered partition list.
pub type PartitionId = usize;

/// Maps a `(table, key)` pair to the partition that owns it.
///
/// Routing must agree on every node, so implementations hash with a stable,
/// process-independent function.
pub trait Partitioner: Send + Sync + 'static {
    fn partition(&self, table: &str, key: &str) -> PartitionId;
}

/// Spreads every table's keys over all partitions.
#[derive(Debug, Clone)]
pub struct KeyHashPartitioner {
    partitions: usize,
}

impl KeyHashPartitioner {
    pub fn new(partitions: usize) -> Self {
        KeyHashPartitioner { partitions: partitions.max(1) }
    }
}

impl Partitioner for KeyHashPartitioner {
    fn partition(&self, _table: &str, key: &str) -> PartitionId {
        (xxh3_64(key.as_bytes()) % self.partitions as u64) as PartitionId
    }
}

/// Places a whole table on one partition, so any batch or transaction
/// within the table is single-partition.
#[derive(Debug, Clone)]
pub struct TableHashPartitioner {
    partitions: usize,
}

impl TableHashPartitioner {
    pub fn new(partitions: usize) -> Self {
        TableHashPartitioner { partitions: partitions.max(1) }
    }
}

impl Partitioner for TableHashPartitioner {
    fn partition(&self, table: &str, _key: &str) -> PartitionId {
        (xxh3_64(table.as_bytes()) % self.partitions as u64) as PartitionId
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionerKind {
    #[default]
    Key,
    Table,
}

impl PartitionerKind {
    pub fn build(self, partitions: usize) -> Arc<dyn Partitioner> {
        match self {
            PartitionerKind::Key => Arc::new(KeyHashPartitioner::new(partitions)),
            PartitionerKind::Table => Arc::new(TableHashPartitioner::new(partitions)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_is_stable_and_in_range() {
        let p = KeyHashPartitioner::new(7);
        for i in 0..200 {
            let key = format!("{i:x}");
            let id = p.partition("t", &key);
            assert!(id < 7);
            assert_eq!(id, p.partition("other", &key));
        }
    }

    #[test]
    fn key_hash_spreads_keys() {
        let p = KeyHashPartitioner::new(3);
        let mut seen = [false; 3];
        for i in 0..100 {
            seen[p.partition("t", &format!("key-{i}"))] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn table_hash_colocates_table() {
        let p = TableHashPartitioner::new(5);
        let first = p.partition("intents", "a");
        assert!((0..50).all(|i| p.partition("intents", &i.to_string()) == first));
    }

    #[test]
    fn zero_partitions_collapses_to_one() {
        assert_eq!(KeyHashPartitioner::new(0).partition("t", "k"), 0);
    }
}
