//! The interned symbol table
//!
//! A process-wide string key to string value map that survives the
//! checkpoint cycle. Buckets keep their chains sorted (descending) so
//! lookups can stop early and the persisted order is deterministic.

const TABLE_BUCKETS: usize = 69;

/// Position-weighted character sum, kept byte-compatible with the
/// persisted bucket order.
fn bucket_of(key: &str) -> usize {
    let mut hash: usize = 0;
    for (i, b) in key.bytes().enumerate() {
        hash = ((i + 1) * b as usize + hash) % TABLE_BUCKETS;
    }
    hash
}

pub struct SymbolTable {
    buckets: Vec<Vec<(String, String)>>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            buckets: vec![Vec::new(); TABLE_BUCKETS],
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let chain = &self.buckets[bucket_of(key)];
        for (k, v) in chain {
            match key.cmp(k.as_str()) {
                std::cmp::Ordering::Equal => return Some(v),
                std::cmp::Ordering::Greater => return None,
                std::cmp::Ordering::Less => {}
            }
        }
        None
    }

    /// Insert or overwrite. Chains stay sorted descending by key.
    pub fn set(&mut self, key: &str, value: &str) {
        let chain = &mut self.buckets[bucket_of(key)];
        for i in 0..chain.len() {
            match key.cmp(chain[i].0.as_str()) {
                std::cmp::Ordering::Equal => {
                    chain[i].1 = value.to_string();
                    return;
                }
                std::cmp::Ordering::Greater => {
                    chain.insert(i, (key.to_string(), value.to_string()));
                    return;
                }
                std::cmp::Ordering::Less => {}
            }
        }
        chain.push((key.to_string(), value.to_string()));
    }

    /// Remove a key. Missing keys are ignored.
    pub fn delete(&mut self, key: &str) {
        let chain = &mut self.buckets[bucket_of(key)];
        chain.retain(|(k, _)| k != key);
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for chain in &mut self.buckets {
            chain.clear();
        }
    }

    /// Visit every pair in persisted order (bucket order, then chain
    /// order). The checkpoint writer relies on this.
    pub fn for_each<F: FnMut(&str, &str)>(&self, mut f: F) {
        for chain in &self.buckets {
            for (k, v) in chain {
                f(k, v);
            }
        }
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}
