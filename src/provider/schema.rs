//! Relational schema definitions

/// SQL to create the entries table.
///
/// `parent_id` carries no foreign key: parent links are weak references
/// and a dangling link is legal.
pub const CREATE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id BIGSERIAL PRIMARY KEY,
    agent_name TEXT NOT NULL,
    task TEXT NOT NULL,
    response TEXT NOT NULL,
    success_rating INTEGER NOT NULL CHECK (success_rating BETWEEN 1 AND 5),
    model_used TEXT NOT NULL DEFAULT 'unknown',
    tokens_used BIGINT NOT NULL DEFAULT 0 CHECK (tokens_used >= 0),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    parent_id BIGINT
)
"#;

/// SQL to create indexes.
///
/// The GIN expression index must match the expression used by query
/// predicates exactly, or the planner falls back to a sequential scan.
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_entries_fts ON entries \
     USING GIN (to_tsvector('english', task || ' ' || response))",
    "CREATE INDEX IF NOT EXISTS idx_entries_agent ON entries(agent_name)",
    "CREATE INDEX IF NOT EXISTS idx_entries_model ON entries(model_used)",
    "CREATE INDEX IF NOT EXISTS idx_entries_created ON entries(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_entries_parent ON entries(parent_id)",
];

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![CREATE_ENTRIES_TABLE];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
