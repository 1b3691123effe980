//! Mapping between absolute store keys and namespace-relative cache keys.

const SEPARATOR: char = '/';

/// The immutable key prefix (`{name}/`) that scopes every remote key tracked
/// by one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    name: String,
    prefix: String,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let prefix = format!("{name}{SEPARATOR}");
        Self { name, prefix }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Strips the namespace prefix. Keys outside the namespace come back
    /// unchanged; the prefix-scoped watch never delivers them.
    pub fn to_relative<'a>(&self, absolute: &'a str) -> &'a str {
        absolute.strip_prefix(self.prefix.as_str()).unwrap_or(absolute)
    }

    pub fn to_absolute(&self, relative: &str) -> String {
        format!("{}{}", self.prefix, relative)
    }
}

/// Smallest key greater than every key starting with `prefix`, as etcd
/// expects in `range_end`. An all-`0xff` prefix has no upper bound and maps
/// to `[0]`, which etcd reads as "to the end of the keyspace".
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}
