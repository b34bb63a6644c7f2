// =============================================================================
// Statement Store — Rendered transformation statements per window
// =============================================================================
//
// Every materialization is driven by one SQL statement that states the full
// contract: scope to a single hour partition, collapse duplicate natural keys
// (last file wins), anti-join against rows already present and insert only the
// missing ones, casting tolerant fields on the way in.  The rendered statement
// is recorded verbatim in the provenance log, so an operator can always see
// exactly what a given query id executed.
//
// The default template is embedded.  Deployments can point
// `lake.statement_template_path` at a file to override it, for example to add
// columns or target differently named tables; the four partition placeholders
// are mandatory so a custom template can never silently widen its scope.
// =============================================================================

use std::path::Path;

use thiserror::Error;

use crate::config::LakeConfig;
use crate::types::FetchWindow;

const DEFAULT_TEMPLATE: &str = r#"INSERT INTO {analytical_table}
WITH ranked AS (
    SELECT
        src.*,
        row_number() OVER (
            PARTITION BY src.asset_id, src.observed_at
            ORDER BY src."$path" DESC
        ) AS rn
    FROM {normalized_table} src
    WHERE src.year = '{year}'
      AND src.month = '{month}'
      AND src.day = '{day}'
      AND src.hour = '{hour}'
)
SELECT
    r.asset_id,
    r.symbol,
    r.name,
    r.price,
    try_cast(r.market_cap AS bigint)      AS market_cap,
    try_cast(r.market_cap_rank AS bigint) AS market_cap_rank,
    try_cast(r.volume_24h AS bigint)      AS volume_24h,
    try_cast(r.pct_change_1h AS double)   AS pct_change_1h,
    try_cast(r.pct_change_24h AS double)  AS pct_change_24h,
    try_cast(r.pct_change_7d AS double)   AS pct_change_7d,
    r.observed_at,
    r.year,
    r.month,
    r.day,
    r.hour,
    cast(to_unixtime(now()) AS bigint)    AS inserted_at,
    '{window_start}'                      AS source_fetch_window
FROM ranked r
LEFT JOIN {analytical_table} dst
    ON  dst.asset_id = r.asset_id
    AND dst.observed_at = r.observed_at
    AND dst.year = '{year}'
    AND dst.month = '{month}'
    AND dst.day = '{day}'
    AND dst.hour = '{hour}'
WHERE r.rn = 1
  AND dst.asset_id IS NULL
"#;

/// Placeholders a template must contain to stay scoped to one window.
const REQUIRED_PLACEHOLDERS: [&str; 4] = ["{year}", "{month}", "{day}", "{hour}"];

#[derive(Debug, Error)]
pub enum StatementError {
    #[error("failed to read statement template {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("statement template is missing the {0} placeholder")]
    MissingPlaceholder(&'static str),
}

/// Source of rendered transformation statements.
pub trait StatementStore: Send + Sync {
    /// The statement materializing `window`, with every placeholder filled in.
    fn statement_for(&self, window: &FetchWindow) -> Result<String, StatementError>;
}

/// Statement store backed by a placeholder template, embedded by default and
/// optionally loaded from a file.
pub struct TemplateStore {
    template: String,
    normalized_table: String,
    analytical_table: String,
}

impl TemplateStore {
    pub fn from_config(lake: &LakeConfig) -> Result<Self, StatementError> {
        let template = match &lake.statement_template_path {
            Some(path) => read_template(path)?,
            None => DEFAULT_TEMPLATE.to_string(),
        };
        Ok(Self {
            template,
            normalized_table: lake.normalized_table.clone(),
            analytical_table: lake.analytical_table.clone(),
        })
    }
}

fn read_template(path: &Path) -> Result<String, StatementError> {
    std::fs::read_to_string(path).map_err(|source| StatementError::Read {
        path: path.display().to_string(),
        source,
    })
}

impl StatementStore for TemplateStore {
    fn statement_for(&self, window: &FetchWindow) -> Result<String, StatementError> {
        for placeholder in REQUIRED_PLACEHOLDERS {
            if !self.template.contains(placeholder) {
                return Err(StatementError::MissingPlaceholder(placeholder));
            }
        }
        Ok(render(
            &self.template,
            &self.normalized_table,
            &self.analytical_table,
            window,
        ))
    }
}

fn render(template: &str, normalized: &str, analytical: &str, window: &FetchWindow) -> String {
    template
        .replace("{normalized_table}", normalized)
        .replace("{analytical_table}", analytical)
        .replace("{year}", &format!("{:04}", window.year()))
        .replace("{month}", &format!("{:02}", window.month()))
        .replace("{day}", &format!("{:02}", window.day()))
        .replace("{hour}", &format!("{:02}", window.hour()))
        .replace("{window_start}", &window.label())
}
