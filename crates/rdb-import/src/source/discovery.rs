//! Selection of the tables to import.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use tracing::{debug, info, warn};

use crate::config::{Config, NameFilter, TableMap, TableOptions};
use crate::core::schema::TableIdentity;
use crate::core::TableDecision;
use crate::error::{ImportError, Result};
use crate::source::SourceCatalog;

/// Compiled form of a [`NameFilter`].
#[derive(Debug, Clone)]
pub enum NameMatcher {
    Exact { name: String, ignore_case: bool },
    Pattern(Regex),
}

impl NameMatcher {
    pub fn new(filter: &NameFilter) -> Result<Self> {
        match filter {
            NameFilter::Exact(name) => Ok(NameMatcher::Exact {
                name: name.clone(),
                ignore_case: false,
            }),
            NameFilter::Rule {
                name: Some(name),
                regex: None,
                ignore_case,
            } => Ok(NameMatcher::Exact {
                name: name.clone(),
                ignore_case: *ignore_case,
            }),
            NameFilter::Rule {
                name: None,
                regex: Some(pattern),
                ignore_case,
            } => RegexBuilder::new(&format!("^(?:{})$", pattern))
                .case_insensitive(*ignore_case)
                .build()
                .map(NameMatcher::Pattern)
                .map_err(|e| ImportError::Config(format!("invalid regex '{}': {}", pattern, e))),
            NameFilter::Rule { .. } => Err(ImportError::Config(
                "name filter needs exactly one of 'name' or 'regex'".into(),
            )),
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            NameMatcher::Exact { name, ignore_case: true } => name.to_lowercase() == candidate.to_lowercase(),
            NameMatcher::Exact { name, .. } => name == candidate,
            NameMatcher::Pattern(re) => re.is_match(candidate),
        }
    }
}

/// Include and exclude lists over one kind of name.
struct FilterSet {
    include: Vec<NameMatcher>,
    exclude: Vec<NameMatcher>,
}

impl FilterSet {
    fn new(include: &[NameFilter], exclude: &[NameFilter]) -> Result<Self> {
        Ok(Self {
            include: include.iter().map(NameMatcher::new).collect::<Result<_>>()?,
            exclude: exclude.iter().map(NameMatcher::new).collect::<Result<_>>()?,
        })
    }

    /// An empty include list accepts everything not excluded.
    fn accepts(&self, name: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|m| m.matches(name)))
            && !self.exclude.iter().any(|m| m.matches(name))
    }
}

struct CompiledMap<'a> {
    map: &'a TableMap,
    schemas: FilterSet,
    tables: FilterSet,
}

/// Shares one `Arc` per option set among all decisions using it.
struct OptionsCache<'a> {
    config: &'a Config,
    cache: HashMap<String, Arc<TableOptions>>,
}

impl OptionsCache<'_> {
    fn get(&mut self, name: &str) -> Result<Arc<TableOptions>> {
        if let Some(options) = self.cache.get(name) {
            return Ok(Arc::clone(options));
        }
        let options = self
            .config
            .options(name)
            .cloned()
            .map(Arc::new)
            .ok_or_else(|| ImportError::Config(format!("unknown table options '{}'", name)))?;
        self.cache.insert(name.to_string(), Arc::clone(&options));
        Ok(options)
    }
}

/// Build the candidate table list: pinned tables first, then discovered
/// tables in map order. Every table appears once; the first map accepting
/// a table supplies its options.
///
/// Failing to list schemas aborts discovery. A schema whose tables cannot
/// be listed is skipped with a warning.
pub fn select_tables(config: &Config, catalog: &dyn SourceCatalog) -> Result<Vec<TableDecision>> {
    let mut options = OptionsCache {
        config,
        cache: HashMap::new(),
    };
    let mut seen = BTreeSet::new();
    let mut decisions = Vec::new();

    for table_ref in &config.table_refs {
        let identity = TableIdentity::new(table_ref.schema.as_str(), table_ref.table.as_str());
        if !seen.insert(identity.clone()) {
            warn!("{}: pinned more than once, keeping the first entry", identity);
            continue;
        }
        let opts = options.get(&table_ref.options)?;
        decisions.push(TableDecision::new(identity, opts, Some(table_ref.clone())));
    }

    if !config.table_maps.is_empty() {
        let maps = config
            .table_maps
            .iter()
            .map(|map| {
                Ok(CompiledMap {
                    map,
                    schemas: FilterSet::new(&map.include_schemas, &map.exclude_schemas)?,
                    tables: FilterSet::new(&map.include_tables, &map.exclude_tables)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let schemas = catalog.list_schemas()?;
        debug!("{}: found {} schemas", catalog.dialect(), schemas.len());
        for schema in &schemas {
            if !maps.iter().any(|m| m.schemas.accepts(schema)) {
                continue;
            }
            let tables = match catalog.list_tables(schema) {
                Ok(tables) => tables,
                Err(e) => {
                    warn!("{}: cannot list tables: {}", schema, e);
                    continue;
                }
            };
            for table in tables {
                let Some(map) = maps
                    .iter()
                    .find(|m| m.schemas.accepts(schema) && m.tables.accepts(&table))
                else {
                    continue;
                };
                let identity = TableIdentity::new(schema.as_str(), table);
                if !seen.insert(identity.clone()) {
                    continue;
                }
                let opts = options.get(&map.map.options)?;
                decisions.push(TableDecision::new(identity, opts, None));
            }
        }
    }

    info!("Selected {} tables", decisions.len());
    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableRef;
    use crate::core::schema::SqlType;
    use crate::source::{MemorySource, MemoryTable, ProbedColumn};

    fn catalog() -> MemorySource {
        let table = |s: &str, t: &str| {
            MemoryTable::new(s, t).column(ProbedColumn::new("id", SqlType::Integer))
        };
        MemorySource::new()
            .with_table(table("public", "users"))
            .with_table(table("public", "tmp_users"))
            .with_table(table("Sales", "Orders"))
            .with_table(table("audit", "log"))
    }

    fn config(yaml_maps: &str) -> Config {
        let yaml = format!(
            "source:\n  host: h\n  database: d\n  user: u\ntable_options:\n  - name: default\n  - name: wide\n{}",
            yaml_maps
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn names(decisions: &[TableDecision]) -> Vec<String> {
        decisions.iter().map(|d| d.identity.full_name()).collect()
    }

    #[test]
    fn test_exact_and_regex_matchers() {
        let exact = NameMatcher::new(&NameFilter::Exact("Orders".into())).unwrap();
        assert!(exact.matches("Orders"));
        assert!(!exact.matches("orders"));

        let folded = NameMatcher::new(&NameFilter::Rule {
            name: Some("orders".into()),
            regex: None,
            ignore_case: true,
        })
        .unwrap();
        assert!(folded.matches("ORDERS"));

        let re = NameMatcher::new(&NameFilter::Rule {
            name: None,
            regex: Some("tmp_.*".into()),
            ignore_case: false,
        })
        .unwrap();
        assert!(re.matches("tmp_users"));
        // anchored at both ends
        assert!(!re.matches("old_tmp_users"));
    }

    #[test]
    fn test_maps_include_and_exclude() {
        let cfg = config(
            "table_maps:\n  - include_schemas: [public]\n    exclude_tables:\n      - regex: 'tmp_.*'\n",
        );
        let decisions = select_tables(&cfg, &catalog()).unwrap();
        assert_eq!(names(&decisions), vec!["public.users"]);
    }

    #[test]
    fn test_first_map_wins() {
        let cfg = config(
            "table_maps:\n  - options: wide\n    include_schemas:\n      - name: sales\n        ignore_case: true\n  - include_schemas:\n      - regex: '.*'\n",
        );
        let decisions = select_tables(&cfg, &catalog()).unwrap();
        let orders = decisions
            .iter()
            .find(|d| d.identity.table == "Orders")
            .unwrap();
        assert_eq!(orders.options.name, "wide");
        let log = decisions.iter().find(|d| d.identity.table == "log").unwrap();
        assert_eq!(log.options.name, "default");
        assert_eq!(decisions.len(), 4);
    }

    #[test]
    fn test_refs_come_first_and_are_not_repeated() {
        let mut cfg = config("table_maps:\n  - include_schemas: [public]\n");
        cfg.table_refs.push(TableRef {
            options: "wide".into(),
            schema: "public".into(),
            table: "users".into(),
            query: None,
            key_columns: vec!["id".into()],
        });
        let decisions = select_tables(&cfg, &catalog()).unwrap();
        assert_eq!(names(&decisions), vec!["public.users", "public.tmp_users"]);
        assert!(decisions[0].table_ref.is_some());
        assert_eq!(decisions[0].options.name, "wide");
        assert!(decisions[1].table_ref.is_none());
    }

    #[test]
    fn test_decisions_share_option_sets() {
        let cfg = config("table_maps:\n  - include_schemas: [public]\n");
        let decisions = select_tables(&cfg, &catalog()).unwrap();
        assert!(Arc::ptr_eq(&decisions[0].options, &decisions[1].options));
    }
}
