//! Configuration validation.

use std::collections::HashSet;

use super::{Config, NameFilter};
use crate::error::{ImportError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(ImportError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(ImportError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(ImportError::Config("source.user is required".into()));
    }
    if config.source.r#type != "postgres" {
        return Err(ImportError::Config(format!(
            "source.type must be 'postgres', got '{}'",
            config.source.r#type
        )));
    }
    if !matches!(
        config.source.ssl_mode.as_str(),
        "disable" | "require" | "verify-full"
    ) {
        return Err(ImportError::Config(format!(
            "source.ssl_mode must be 'disable', 'require' or 'verify-full', got '{}'",
            config.source.ssl_mode
        )));
    }

    if let Some(0) = config.workers.pool_size {
        return Err(ImportError::Config(
            "workers.pool_size must be at least 1".into(),
        ));
    }

    if let Some(target) = &config.target {
        if target.max_batch_rows == 0 || target.max_batch_rows > 1_000_000 {
            return Err(ImportError::Config(format!(
                "target.max_batch_rows must be between 1 and 1000000, got {}",
                target.max_batch_rows
            )));
        }
    }

    // Option sets
    let mut names = HashSet::new();
    for opts in &config.table_options {
        if !names.insert(opts.name.as_str()) {
            return Err(ImportError::Config(format!(
                "duplicate table_options name '{}'",
                opts.name
            )));
        }
        if opts.table_name_format.trim().is_empty() || opts.blob_name_format.trim().is_empty() {
            return Err(ImportError::Config(format!(
                "table_options '{}': name formats must not be empty",
                opts.name
            )));
        }
        if opts.min_partitions > opts.max_partitions {
            return Err(ImportError::Config(format!(
                "table_options '{}': min_partitions exceeds max_partitions",
                opts.name
            )));
        }
    }

    for map in &config.table_maps {
        if !names.contains(map.options.as_str()) {
            return Err(ImportError::Config(format!(
                "table_maps entry references unknown options '{}'",
                map.options
            )));
        }
        for filter in map
            .include_schemas
            .iter()
            .chain(&map.exclude_schemas)
            .chain(&map.include_tables)
            .chain(&map.exclude_tables)
        {
            validate_filter(filter)?;
        }
    }

    for table_ref in &config.table_refs {
        if !names.contains(table_ref.options.as_str()) {
            return Err(ImportError::Config(format!(
                "table_refs entry {}.{} references unknown options '{}'",
                table_ref.schema, table_ref.table, table_ref.options
            )));
        }
        if table_ref.table.is_empty() {
            return Err(ImportError::Config(
                "table_refs entry requires a table name".into(),
            ));
        }
    }

    if config.table_maps.is_empty() && config.table_refs.is_empty() {
        return Err(ImportError::Config(
            "at least one of table_maps or table_refs is required".into(),
        ));
    }

    Ok(())
}

fn validate_filter(filter: &NameFilter) -> Result<()> {
    match filter {
        NameFilter::Exact(name) if name.is_empty() => {
            Err(ImportError::Config("empty name filter".into()))
        }
        NameFilter::Exact(_) => Ok(()),
        NameFilter::Rule { name, regex, .. } => match (name, regex) {
            (Some(_), Some(_)) | (None, None) => Err(ImportError::Config(
                "name filter needs exactly one of 'name' or 'regex'".into(),
            )),
            (Some(_), None) => Ok(()),
            (None, Some(pattern)) => regex::Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| ImportError::Config(format!("invalid regex '{}': {}", pattern, e))),
        },
    }
}
