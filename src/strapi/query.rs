//! Strapi's bracketed query-string conventions
//! (`filters[sender][id][$ne]=4`, `pagination[pageSize]=50`, `sort=id:asc`).

use std::fmt::Display;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pairs: Vec<(String, String)>,
    populate: usize,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// `path` is the field path followed by the operator, e.g.
    /// `["conversation", "id", "$eq"]`.
    pub fn filter(mut self, path: &[&str], value: impl Display) -> Self {
        let key = path
            .iter()
            .fold(String::from("filters"), |mut key, segment| {
                key.push('[');
                key.push_str(segment);
                key.push(']');
                key
            });
        self.pairs.push((key, value.to_string()));
        self
    }

    pub fn sort(mut self, sort: &str) -> Self {
        self.pairs.push(("sort".to_string(), sort.to_string()));
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.pairs
            .push(("pagination[pageSize]".to_string(), size.to_string()));
        self
    }

    pub fn populate(mut self, field: &str) -> Self {
        self.pairs
            .push((format!("populate[{}]", self.populate), field.to_string()));
        self.populate += 1;
        self
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}
