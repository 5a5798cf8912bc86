//! Built query plus the ordered output columns the result mapper reads back.

use crate::dialect::Dialect;
use crate::sql_ast::{SelectQuery, SqlRenderer};

/// What an output column carries, independent of how a backend names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    GroupKey,
    TimeBucket,
    Cost,
    MinStartTime,
    MaxStartTime,
    Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub alias: String,
    pub kind: ColumnKind,
    /// Column or field the output was derived from.
    pub source: Option<String>,
}

impl OutputColumn {
    pub fn new(alias: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            alias: alias.into(),
            kind,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub query: SelectQuery,
    pub columns: Vec<OutputColumn>,
}

impl QuerySpec {
    /// Limit/offset go on last, after every clause that shapes the aggregation.
    pub fn paginate(mut self, limit: Option<u64>, offset: Option<u64>) -> Self {
        self.query.limit = limit;
        self.query.offset = offset.filter(|o| *o > 0);
        self
    }

    /// Copy with the row cap enforced on `LIMIT`.
    pub fn capped(&self, max_rows: u64) -> QuerySpec {
        let mut spec = self.clone();
        spec.query.limit = Some(spec.query.limit.map_or(max_rows, |l| l.min(max_rows)));
        spec
    }

    pub fn render(&self, dialect: &dyn Dialect) -> String {
        SqlRenderer::new(dialect).render_select(&self.query)
    }

    pub fn column(&self, kind: ColumnKind) -> Option<&OutputColumn> {
        self.columns.iter().find(|c| c.kind == kind)
    }

    pub fn columns_of(&self, kind: ColumnKind) -> impl Iterator<Item = &OutputColumn> {
        self.columns.iter().filter(move |c| c.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_tightens_but_never_loosens_limit() {
        let spec = QuerySpec {
            query: SelectQuery::default(),
            columns: vec![],
        };
        assert_eq!(spec.capped(100).query.limit, Some(100));
        let small = spec.clone().paginate(Some(5), Some(10));
        assert_eq!(small.capped(100).query.limit, Some(5));
        assert_eq!(small.capped(100).query.offset, Some(10));
        let large = spec.paginate(Some(50_000), None);
        assert_eq!(large.capped(10_000).query.limit, Some(10_000));
    }
}
