//! The bill-of-materials header emitted at the top of every generated Containerfile.

use std::collections::BTreeMap;

/// Accumulates `apk:*` / `image:*` / `version:*` entries. Backed by a `BTreeMap` so emission
/// order is always ascending key order without an extra sort step.
#[derive(Debug, Default, Clone)]
pub(crate) struct Bom {
    entries: BTreeMap<String, String>,
}

impl Bom {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_apk(&mut self, name: &str, version: &str) {
        self.entries
            .insert(format!("apk:{name}"), version.to_string());
    }

    pub(crate) fn insert_image(&mut self, short_name: &str, digest: &str) {
        self.entries
            .insert(format!("image:{short_name}"), digest.to_string());
    }

    pub(crate) fn insert_version(&mut self, key: &str, value: &str) {
        self.entries
            .insert(format!("version:{key}"), value.to_string());
    }

    /// The `# BOM: <json>` header line. Keys are already sorted by construction.
    pub(crate) fn header_line(&self) -> String {
        let json = serde_json::to_string(&self.entries).expect("map of strings always serializes");
        format!("{}{json}", dfo_config::BOM_HEADER_PREFIX)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_line_sorts_keys_across_categories() {
        let mut bom = Bom::new();
        bom.insert_image("top", "sha256:ccc");
        bom.insert_apk("git", "2.43.0-r0");
        bom.insert_apk("pcre2", "10.42-r1");
        bom.insert_version("alpine", "3.19");

        let line = bom.header_line();
        let prefix = "# BOM: ";
        assert!(line.starts_with(prefix));
        let json = &line[prefix.len()..];
        let keys: Vec<&str> = json
            .trim_start_matches('{')
            .trim_end_matches('}')
            .split(',')
            .map(|kv| kv.split(':').next().unwrap().trim_matches('"'))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
