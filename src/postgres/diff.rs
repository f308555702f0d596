// ABOUTME: Diff engine - computes insert/update/delete change rows with set-based SQL
// ABOUTME: Full-table and dirty-subset variants, all tagged with the caller's txid

use tokio_postgres::GenericClient;

use crate::change::DiffStats;
use crate::error::{DbContext, Result};
use crate::model::TableModel;
use crate::sql::{
    columns_distinct_clause, columns_equal_clause, quote_ident, select_list, Relation,
};

/// Computes the change rows that make a tracked table equal to a source
/// relation and writes them to the table's change table.
///
/// The statements are plain set operations over primary keys, executed by
/// PostgreSQL. Run every call inside the transaction that owns `txid`;
/// rolling that transaction back discards all rows written here.
///
/// Derived columns are left NULL on inserted and updated rows. Recompute them
/// with [`derive_columns_for_change`](super::derive_columns_for_change) before
/// applying.
pub struct DiffEngine<'a, C: GenericClient> {
    client: &'a C,
}

impl<'a, C: GenericClient> DiffEngine<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Record inserts for keys present in `source` but not in the tracked table.
    ///
    /// `columns` restricts the projected columns (key and derived columns are
    /// always included); `None` projects every column.
    pub async fn compute_inserts(
        &self,
        txid: i64,
        source: &Relation,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<u64> {
        let target = tracked_relation(model)?;
        self.inserts(txid, source, &target, None, model, columns).await
    }

    /// Like [`compute_inserts`](Self::compute_inserts), restricted to keys in `dirty`.
    pub async fn compute_inserts_subset(
        &self,
        txid: i64,
        source: &Relation,
        dirty: &Relation,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<u64> {
        let target = tracked_relation(model)?;
        self.inserts(txid, source, &target, Some(dirty), model, columns)
            .await
    }

    /// Record updates for keys present on both sides whose compared columns differ.
    ///
    /// `non_preserved` lists the columns refreshed from `source`; every other
    /// column keeps its current value. `None` refreshes all columns. A column
    /// left out by mistake is never updated and no error is raised.
    pub async fn compute_updates(
        &self,
        txid: i64,
        source: &Relation,
        model: &TableModel,
        non_preserved: Option<&[&str]>,
    ) -> Result<u64> {
        let target = tracked_relation(model)?;
        self.updates(txid, source, &target, None, model, non_preserved)
            .await
    }

    /// Like [`compute_updates`](Self::compute_updates), restricted to keys in `dirty`.
    pub async fn compute_updates_subset(
        &self,
        txid: i64,
        source: &Relation,
        dirty: &Relation,
        model: &TableModel,
        non_preserved: Option<&[&str]>,
    ) -> Result<u64> {
        let target = tracked_relation(model)?;
        self.updates(txid, source, &target, Some(dirty), model, non_preserved)
            .await
    }

    /// Record deletes for keys present in the tracked table but not in `source`.
    pub async fn compute_deletes(
        &self,
        txid: i64,
        source: &Relation,
        model: &TableModel,
    ) -> Result<u64> {
        let target = tracked_relation(model)?;
        self.deletes(txid, source, &target, None, model).await
    }

    /// Like [`compute_deletes`](Self::compute_deletes), restricted to keys in `dirty`.
    pub async fn compute_deletes_subset(
        &self,
        txid: i64,
        source: &Relation,
        dirty: &Relation,
        model: &TableModel,
    ) -> Result<u64> {
        let target = tracked_relation(model)?;
        self.deletes(txid, source, &target, Some(dirty), model).await
    }

    /// Inserts, then updates, then deletes against the tracked table.
    pub async fn compute_differences(
        &self,
        txid: i64,
        source: &Relation,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<DiffStats> {
        let target = tracked_relation(model)?;
        self.differences(txid, source, &target, None, model, columns)
            .await
    }

    /// Composite diff restricted to the keys of `dirty`.
    pub async fn compute_differences_subset(
        &self,
        txid: i64,
        source: &Relation,
        dirty: &Relation,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<DiffStats> {
        let target = tracked_relation(model)?;
        self.differences(txid, source, &target, Some(dirty), model, columns)
            .await
    }

    /// Composite diff against `target` instead of the model's tracked table.
    ///
    /// Change rows still land in the model's change table.
    pub async fn compute_differences_view(
        &self,
        txid: i64,
        source: &Relation,
        target: &Relation,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<DiffStats> {
        self.differences(txid, source, target, None, model, columns)
            .await
    }

    async fn differences(
        &self,
        txid: i64,
        source: &Relation,
        target: &Relation,
        dirty: Option<&Relation>,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<DiffStats> {
        let inserts = self
            .inserts(txid, source, target, dirty, model, columns)
            .await?;
        let updates = self
            .updates(txid, source, target, dirty, model, columns)
            .await?;
        let deletes = self.deletes(txid, source, target, dirty, model).await?;

        let stats = DiffStats {
            inserts,
            updates,
            deletes,
        };
        tracing::info!(
            "Diffed {} against {} (txid {}): {} inserts, {} updates, {} deletes",
            source,
            target,
            txid,
            stats.inserts,
            stats.updates,
            stats.deletes
        );
        Ok(stats)
    }

    async fn inserts(
        &self,
        txid: i64,
        source: &Relation,
        target: &Relation,
        dirty: Option<&Relation>,
        model: &TableModel,
        columns: Option<&[&str]>,
    ) -> Result<u64> {
        let projection = model.insert_projection(columns)?;
        let sql = build_inserts_sql(model, source, target, dirty, &projection);
        let inserted = self
            .client
            .execute(sql.as_str(), &[&txid])
            .await
            .db_context(|| format!("Failed to compute inserts for {}", model.table()))?;
        tracing::debug!("{} insert rows recorded for {}", inserted, model.table());
        Ok(inserted)
    }

    async fn updates(
        &self,
        txid: i64,
        source: &Relation,
        target: &Relation,
        dirty: Option<&Relation>,
        model: &TableModel,
        non_preserved: Option<&[&str]>,
    ) -> Result<u64> {
        let Some(sql) = build_updates_sql(model, source, target, dirty, non_preserved)? else {
            tracing::debug!(
                "{} has no compared columns, skipping update detection",
                model.table()
            );
            return Ok(0);
        };
        let updated = self
            .client
            .execute(sql.as_str(), &[&txid])
            .await
            .db_context(|| format!("Failed to compute updates for {}", model.table()))?;
        tracing::debug!("{} update rows recorded for {}", updated, model.table());
        Ok(updated)
    }

    async fn deletes(
        &self,
        txid: i64,
        source: &Relation,
        target: &Relation,
        dirty: Option<&Relation>,
        model: &TableModel,
    ) -> Result<u64> {
        let sql = build_deletes_sql(model, source, target, dirty);
        let deleted = self
            .client
            .execute(sql.as_str(), &[&txid])
            .await
            .db_context(|| format!("Failed to compute deletes for {}", model.table()))?;
        tracing::debug!("{} delete rows recorded for {}", deleted, model.table());
        Ok(deleted)
    }
}

fn tracked_relation(model: &TableModel) -> Result<Relation> {
    Relation::parse(model.table())
}

/// `SELECT <keys> FROM <relation>`, narrowed to the dirty keys when given.
fn key_set_sql(model: &TableModel, relation: &Relation, dirty: Option<&Relation>) -> String {
    let keys = select_list(None, model.primary_key());
    match dirty {
        Some(dirty) => format!(
            "SELECT {keys} FROM {} JOIN {} USING ({keys})",
            relation.quoted(),
            dirty.quoted()
        ),
        None => format!("SELECT {keys} FROM {}", relation.quoted()),
    }
}

/// Build the statement recording inserts.
///
/// ```sql
/// WITH ids AS (SELECT "kode" FROM "src" EXCEPT SELECT "kode" FROM "ejerlav")
/// INSERT INTO "ejerlav_changes" (txid, operation, public, "kode", "navn")
/// SELECT $1::bigint, 'insert', true, t."kode", t."navn" FROM "src" t JOIN ids USING ("kode")
/// ```
fn build_inserts_sql(
    model: &TableModel,
    source: &Relation,
    target: &Relation,
    dirty: Option<&Relation>,
    projection: &[&str],
) -> String {
    // Derived columns stay NULL until recomputed
    let from_source: Vec<&str> = projection
        .iter()
        .copied()
        .filter(|c| model.column(c).map_or(false, |col| !col.is_derived()))
        .collect();
    let keys = select_list(None, model.primary_key());
    format!(
        "WITH ids AS ({after} EXCEPT {before}) \
         INSERT INTO {changes} (txid, operation, public, {columns}) \
         SELECT $1::bigint, 'insert', true, {values} FROM {source} t JOIN ids USING ({keys})",
        after = key_set_sql(model, source, dirty),
        before = key_set_sql(model, target, dirty),
        changes = quote_ident(&model.change_table()),
        columns = select_list(None, &from_source),
        values = select_list(Some("t"), &from_source),
        source = source.quoted(),
        keys = keys,
    )
}

/// Build the statement recording updates, or `None` when the model has no
/// columns to compare.
///
/// `before` is the tracked row; `after` takes the non-preserved columns from
/// the source and the rest from `before`. A row is recorded when any compared
/// column is distinct between the two, and is public when a public column is.
fn build_updates_sql(
    model: &TableModel,
    source: &Relation,
    target: &Relation,
    dirty: Option<&Relation>,
    non_preserved: Option<&[&str]>,
) -> Result<Option<String>> {
    let compared = model.compared_column_names();
    if compared.is_empty() {
        return Ok(None);
    }
    let split = model.update_split(non_preserved)?;
    let stored = model.non_derived_column_names();
    let keys = select_list(None, model.primary_key());

    let (candidates, before_from, source_from) = match dirty {
        Some(_) => (
            format!(
                "candidates AS ({} INTERSECT {}), ",
                key_set_sql(model, target, dirty),
                key_set_sql(model, source, dirty)
            ),
            format!("{} b JOIN candidates USING ({keys})", target.quoted()),
            format!("{} s JOIN candidates USING ({keys})", source.quoted()),
        ),
        None => (
            String::new(),
            format!("{} b", target.quoted()),
            format!("{} s", source.quoted()),
        ),
    };

    let mut after_columns = select_list(Some("raw_after"), &split.from_source);
    if !split.preserved.is_empty() {
        after_columns.push_str(", ");
        after_columns.push_str(&select_list(Some("before"), &split.preserved));
    }

    let sql = format!(
        "WITH {candidates}\
         before AS (SELECT {before_columns} FROM {before_from}), \
         raw_after AS (SELECT {source_columns} FROM {source_from}), \
         after AS (SELECT {after_columns} FROM before JOIN raw_after ON {join_raw}), \
         changed AS (SELECT {changed_columns}, {public_clause} AS is_public \
         FROM before JOIN after ON {join_after} WHERE {distinct}) \
         INSERT INTO {changes} (txid, operation, public, {stored_list}) \
         SELECT $1::bigint, 'update', is_public, {stored_list} FROM changed",
        candidates = candidates,
        before_columns = select_list(Some("b"), &stored),
        before_from = before_from,
        source_columns = select_list(Some("s"), &split.from_source),
        source_from = source_from,
        after_columns = after_columns,
        join_raw = columns_equal_clause("before", "raw_after", model.primary_key()),
        changed_columns = select_list(Some("after"), &stored),
        public_clause = public_clause(model),
        join_after = columns_equal_clause("before", "after", model.primary_key()),
        distinct = columns_distinct_clause("before", "after", &compared),
        changes = quote_ident(&model.change_table()),
        stored_list = select_list(None, &stored),
    );
    Ok(Some(sql))
}

/// Predicate deciding whether an update row is replication-visible.
fn public_clause(model: &TableModel) -> String {
    if !model.has_non_public_columns() {
        return "true".to_string();
    }
    let public_columns = model.public_compared_column_names();
    // An empty list renders as "false"
    columns_distinct_clause("before", "after", &public_columns)
}

/// Build the statement recording deletes with the full before image.
fn build_deletes_sql(
    model: &TableModel,
    source: &Relation,
    target: &Relation,
    dirty: Option<&Relation>,
) -> String {
    let all = model.all_column_names();
    format!(
        "WITH ids AS ({before} EXCEPT {after}) \
         INSERT INTO {changes} (txid, operation, public, {columns}) \
         SELECT $1::bigint, 'delete', true, {values} FROM {target} t JOIN ids USING ({keys})",
        before = key_set_sql(model, target, dirty),
        after = key_set_sql(model, source, dirty),
        changes = quote_ident(&model.change_table()),
        columns = select_list(None, &all),
        values = select_list(Some("t"), &all),
        target = target.quoted(),
        keys = select_list(None, model.primary_key()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, DeriveStep};

    fn ejerlav() -> TableModel {
        TableModel::new(
            "ejerlav",
            "ejerlav",
            vec!["kode".into()],
            vec![
                Column::new("kode"),
                Column::new("navn"),
                Column::new("tsv")
                    .non_public()
                    .derived(DeriveStep::sql("to_tsvector('simple', coalesce(navn, ''))")),
            ],
        )
        .unwrap()
    }

    fn rel(name: &str) -> Relation {
        Relation::parse(name).unwrap()
    }

    #[test]
    fn test_inserts_sql_uses_key_difference() {
        let model = ejerlav();
        let projection = model.insert_projection::<&str>(None).unwrap();
        let sql = build_inserts_sql(&model, &rel("fetch_ejerlav"), &rel("ejerlav"), None, &projection);

        assert!(sql.contains(
            "WITH ids AS (SELECT \"kode\" FROM \"fetch_ejerlav\" EXCEPT SELECT \"kode\" FROM \"ejerlav\")"
        ));
        assert!(sql.contains("INSERT INTO \"ejerlav_changes\" (txid, operation, public, \"kode\", \"navn\")"));
        assert!(sql.contains("SELECT $1::bigint, 'insert', true, t.\"kode\", t.\"navn\""));
        assert!(!sql.contains("tsv"), "derived columns are never read from the source");
    }

    #[test]
    fn test_inserts_subset_sql_scopes_to_dirty_keys() {
        let model = ejerlav();
        let projection = model.insert_projection::<&str>(None).unwrap();
        let sql = build_inserts_sql(
            &model,
            &rel("fetch_ejerlav"),
            &rel("ejerlav"),
            Some(&rel("dirty_ejerlav")),
            &projection,
        );
        assert!(sql.contains("FROM \"fetch_ejerlav\" JOIN \"dirty_ejerlav\" USING (\"kode\")"));
        assert!(sql.contains("FROM \"ejerlav\" JOIN \"dirty_ejerlav\" USING (\"kode\")"));
    }

    #[test]
    fn test_updates_sql_compares_non_derived_columns() {
        let model = ejerlav();
        let sql = build_updates_sql(&model, &rel("fetch_ejerlav"), &rel("ejerlav"), None, None)
            .unwrap()
            .unwrap();

        assert!(sql.contains("WHERE (before.\"navn\" IS DISTINCT FROM after.\"navn\")"));
        assert!(sql.contains("SELECT $1::bigint, 'update', is_public, \"kode\", \"navn\" FROM changed"));
        assert!(!sql.contains("candidates"));
        // tsv is non-public but derived, so visibility hinges on navn alone
        assert!(sql.contains("(before.\"navn\" IS DISTINCT FROM after.\"navn\") AS is_public"));
    }

    #[test]
    fn test_updates_sql_carries_preserved_columns_forward() {
        let model = TableModel::new(
            "vejstykke",
            "vejstykker",
            vec!["kommunekode".into(), "kode".into()],
            vec![
                Column::new("kommunekode"),
                Column::new("kode"),
                Column::new("vejnavn"),
                Column::new("oprettet"),
            ],
        )
        .unwrap();
        let sql = build_updates_sql(
            &model,
            &rel("fetch_vejstykker"),
            &rel("vejstykker"),
            None,
            Some(&["vejnavn"][..]),
        )
        .unwrap()
        .unwrap();

        assert!(sql.contains(
            "after AS (SELECT raw_after.\"kommunekode\", raw_after.\"kode\", raw_after.\"vejnavn\", before.\"oprettet\""
        ));
        assert!(sql.contains(
            "ON before.\"kommunekode\" = raw_after.\"kommunekode\" AND before.\"kode\" = raw_after.\"kode\""
        ));
        // No non-public columns: every detected update is public
        assert!(sql.contains("true AS is_public"));
    }

    #[test]
    fn test_updates_subset_sql_intersects_dirty_keys() {
        let model = ejerlav();
        let sql = build_updates_sql(
            &model,
            &rel("fetch_ejerlav"),
            &rel("ejerlav"),
            Some(&rel("dirty")),
            None,
        )
        .unwrap()
        .unwrap();
        assert!(sql.contains(
            "candidates AS (SELECT \"kode\" FROM \"ejerlav\" JOIN \"dirty\" USING (\"kode\") INTERSECT SELECT \"kode\" FROM \"fetch_ejerlav\" JOIN \"dirty\" USING (\"kode\"))"
        ));
        assert!(sql.contains("FROM \"ejerlav\" b JOIN candidates USING (\"kode\")"));
    }

    #[test]
    fn test_updates_sql_is_none_without_compared_columns() {
        let model = TableModel::new(
            "tilknytning",
            "tilknytninger",
            vec!["a".into(), "b".into()],
            vec![Column::new("a"), Column::new("b")],
        )
        .unwrap();
        assert!(
            build_updates_sql(&model, &rel("src"), &rel("tilknytninger"), None, None)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_public_clause_without_public_compared_columns_is_false() {
        let model = TableModel::new(
            "x",
            "x",
            vec!["id".into()],
            vec![Column::new("id"), Column::new("internal").non_public()],
        )
        .unwrap();
        assert_eq!(public_clause(&model), "false");
    }

    #[test]
    fn test_deletes_sql_copies_full_before_image() {
        let model = ejerlav();
        let sql = build_deletes_sql(&model, &rel("fetch_ejerlav"), &rel("ejerlav"), None);
        assert!(sql.contains(
            "WITH ids AS (SELECT \"kode\" FROM \"ejerlav\" EXCEPT SELECT \"kode\" FROM \"fetch_ejerlav\")"
        ));
        assert!(sql.contains("SELECT $1::bigint, 'delete', true, t.\"kode\", t.\"navn\", t.\"tsv\" FROM \"ejerlav\" t"));
    }

    #[test]
    fn test_diff_stats() {
        let stats = DiffStats {
            inserts: 2,
            updates: 1,
            deletes: 0,
        };
        assert_eq!(stats.total(), 3);
        assert!(!stats.is_empty());
        assert!(DiffStats::default().is_empty());
    }
}
