use std::collections::BTreeMap;
use std::path::Path;

use concord_types::{ConcordError, NodeId};

/// Replicas per partition in a generated assignment.
pub const DEFAULT_REPLICATION: usize = 3;

/// Partition name → ordered replica set, read once at startup.
///
/// ```json
/// {"partitions": {"p1": ["a", "b", "c"], "p2": ["b", "c", "d"]}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartitionAssignment {
    pub partitions: BTreeMap<String, Vec<NodeId>>,
}

impl PartitionAssignment {
    pub fn load(path: &Path) -> Result<Self, ConcordError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConcordError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConcordError> {
        let assignment: PartitionAssignment = serde_json::from_str(raw)
            .map_err(|e| ConcordError::Config(format!("malformed partition assignment: {e}")))?;
        if assignment.partitions.is_empty() {
            return Err(ConcordError::Config("partition assignment is empty".into()));
        }
        if let Some((name, _)) = assignment.partitions.iter().find(|(_, r)| r.is_empty()) {
            return Err(ConcordError::Config(format!("partition {name} has no replicas")));
        }
        Ok(assignment)
    }

    pub fn to_json(&self) -> Result<String, ConcordError> {
        serde_json::to_string_pretty(self).map_err(|e| ConcordError::Codec(e.to_string()))
    }

    /// One partition per node, each replicated on a cyclic window of the
    /// nodes sorted by id.
    pub fn generate(nodes: &[NodeId]) -> Self {
        let mut sorted = nodes.to_vec();
        sorted.sort();
        sorted.dedup();

        let n = sorted.len();
        let width = DEFAULT_REPLICATION.min(n);
        let partitions = (0..n)
            .map(|i| {
                let replicas = (0..width).map(|j| sorted[(i + j) % n].clone()).collect();
                (format!("p{}", i + 1), replicas)
            })
            .collect();
        PartitionAssignment { partitions }
    }

    /// Names in natural order: `p2` before `p10`.
    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.keys().cloned().collect();
        names.sort_by(|a, b| natural_key(a).cmp(&natural_key(b)));
        names
    }

    pub fn replicas(&self, partition: &str) -> Option<&[NodeId]> {
        self.partitions.get(partition).map(Vec::as_slice)
    }

    /// Partitions that list `node` as a replica, in natural order.
    pub fn partitions_for(&self, node: &NodeId) -> Vec<String> {
        self.partition_names()
            .into_iter()
            .filter(|name| self.partitions[name].contains(node))
            .collect()
    }
}

fn natural_key(name: &str) -> (&str, u64, &str) {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (prefix, suffix) = name.split_at(name.len() - digits);
    (prefix, suffix.parse().unwrap_or(0), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn nodes(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|id| NodeId::from(*id)).collect()
    }

    #[test]
    fn generate_five_nodes() {
        let a = PartitionAssignment::generate(&nodes(&["e", "c", "a", "d", "b"]));
        assert_eq!(a.partition_names(), vec!["p1", "p2", "p3", "p4", "p5"]);
        assert_eq!(a.replicas("p1").unwrap(), nodes(&["a", "b", "c"]).as_slice());
        assert_eq!(a.replicas("p4").unwrap(), nodes(&["d", "e", "a"]).as_slice());
        assert_eq!(a.replicas("p5").unwrap(), nodes(&["e", "a", "b"]).as_slice());
        assert!(a.partitions.values().all(|r| r.len() == 3));
        assert_eq!(a.partitions_for(&NodeId::from("a")), vec!["p1", "p4", "p5"]);
    }

    #[test]
    fn generate_small_cluster_caps_replicas() {
        let a = PartitionAssignment::generate(&nodes(&["b", "a"]));
        assert_eq!(a.replicas("p1").unwrap(), nodes(&["a", "b"]).as_slice());
        assert_eq!(a.replicas("p2").unwrap(), nodes(&["b", "a"]).as_slice());
    }

    #[test]
    fn names_sort_naturally() {
        let a = PartitionAssignment::generate(&(0..12).map(|i| NodeId::new(format!("n{i:02}"))).collect::<Vec<_>>());
        let names = a.partition_names();
        assert_eq!(names[1], "p2");
        assert_eq!(names[9], "p10");
        assert_eq!(names.last().unwrap(), "p12");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"partitions": {{"p1": ["a", "b"], "p2": ["b", "c"]}}}}"#).unwrap();

        let a = PartitionAssignment::load(file.path()).unwrap();
        assert_eq!(a.partition_names(), vec!["p1", "p2"]);
        assert_eq!(a.partitions_for(&NodeId::from("b")), vec!["p1", "p2"]);
    }

    #[test]
    fn load_rejects_bad_documents() {
        assert!(matches!(PartitionAssignment::from_json("{"), Err(ConcordError::Config(_))));
        assert!(PartitionAssignment::from_json(r#"{"partitions": {}}"#).is_err());
        assert!(PartitionAssignment::from_json(r#"{"partitions": {"p1": []}}"#).is_err());
        let missing = PartitionAssignment::load(Path::new("/nonexistent/partitions.json"));
        assert!(matches!(missing, Err(ConcordError::Config(_))));
    }

    #[test]
    fn json_shape_round_trips() {
        let a = PartitionAssignment::generate(&nodes(&["a", "b", "c"]));
        let json = a.to_json().unwrap();
        assert!(json.contains("\"partitions\""));
        assert_eq!(PartitionAssignment::from_json(&json).unwrap(), a);
    }
}
