//! Table schemas: ordered columns and index definitions. An index names
//! its columns; the derived [`Spec`] maps them to field positions for
//! key building. The first index is the table's key.

use eyre::Result;

use crate::encoding::ixkey::{IndexMode, Spec};
use crate::errors::{corrupt, query_error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub columns: Vec<String>,
    pub spec: Spec,
}

impl IndexSchema {
    pub fn new(columns: Vec<impl Into<String>>, mode: IndexMode) -> IndexSchema {
        IndexSchema {
            columns: columns.into_iter().map(Into::into).collect(),
            spec: Spec::new([], mode), // positions resolved by Schema::new
        }
    }

    pub fn mode(&self) -> IndexMode {
        self.spec.mode
    }

    pub fn mode_code(&self) -> i64 {
        match self.spec.mode {
            IndexMode::Key => 0,
            IndexMode::Index => 1,
            IndexMode::Unique => 2,
        }
    }

    pub(crate) fn from_code(
        columns: Vec<String>,
        code: i64,
        table_columns: &[String],
    ) -> Result<IndexSchema> {
        let mode = match code {
            0 => IndexMode::Key,
            1 => IndexMode::Index,
            2 => IndexMode::Unique,
            _ => return Err(corrupt("bad index mode")),
        };
        let mut ix = IndexSchema {
            columns,
            spec: Spec::new([], mode),
        };
        ix.resolve(table_columns)?;
        Ok(ix)
    }

    fn resolve(&mut self, table_columns: &[String]) -> Result<()> {
        let fields = self
            .columns
            .iter()
            .map(|c| {
                table_columns
                    .iter()
                    .position(|tc| tc == c)
                    .ok_or_else(|| query_error(format!("index on nonexistent column: {}", c)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.spec = Spec::new(fields, self.spec.mode);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub table: String,
    pub columns: Vec<String>,
    pub indexes: Vec<IndexSchema>,
}

impl Schema {
    pub fn new(
        table: impl Into<String>,
        columns: Vec<impl Into<String>>,
        mut indexes: Vec<IndexSchema>,
    ) -> Result<Schema> {
        let table = table.into();
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if indexes.is_empty() {
            return Err(query_error(format!("table {} must have a key", table)));
        }
        if indexes[0].mode() != IndexMode::Key {
            return Err(query_error(format!(
                "table {}'s first index must be a key",
                table
            )));
        }
        for ix in &mut indexes {
            ix.resolve(&columns)?;
        }
        Ok(Schema {
            table,
            columns,
            indexes,
        })
    }

    pub fn col(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index whose columns equal `cols` as an ordered prefix match.
    pub fn index_for(&self, cols: &[String]) -> Option<usize> {
        self.indexes.iter().position(|ix| ix.columns == cols)
    }

    /// Indexes whose column list starts with `cols`.
    pub fn indexes_prefixed_by(&self, cols: &[String]) -> Vec<usize> {
        self.indexes
            .iter()
            .enumerate()
            .filter(|(_, ix)| ix.columns.starts_with(cols))
            .map(|(i, _)| i)
            .collect()
    }

    /// The column lists of all unique indexes (keys for the query planner).
    pub fn keys(&self) -> Vec<Vec<String>> {
        self.indexes
            .iter()
            .filter(|ix| matches!(ix.mode(), IndexMode::Key))
            .map(|ix| ix.columns.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_field_positions() {
        let s = Schema::new(
            "t",
            vec!["a", "b", "c"],
            vec![
                IndexSchema::new(vec!["a"], IndexMode::Key),
                IndexSchema::new(vec!["c", "b"], IndexMode::Index),
            ],
        )
        .unwrap();
        assert_eq!(&s.indexes[0].spec.fields[..], &[0]);
        assert_eq!(&s.indexes[1].spec.fields[..], &[2, 1]);
    }

    #[test]
    fn rejects_bad_schemas() {
        assert!(Schema::new("t", vec!["a"], Vec::new()).is_err());
        assert!(Schema::new(
            "t",
            vec!["a"],
            vec![IndexSchema::new(vec!["z"], IndexMode::Key)]
        )
        .is_err());
        assert!(Schema::new(
            "t",
            vec!["a"],
            vec![IndexSchema::new(vec!["a"], IndexMode::Index)]
        )
        .is_err());
    }
}
