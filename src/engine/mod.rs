//! The mutation API and `get` orchestration.
//!
//! An [`Engine`] owns the database handle and the component registry. The
//! registry is populated once at [`Engine::register`] time and immutable
//! afterward. Mutations run as transactional sequences of the relation-store
//! and query-builder primitives; `get` runs both traversal directions and the
//! resolution pass under one call-scoped memoization context.

mod resolve;
mod traverse;

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use serde_json::Value as Json;

use crate::component::{self, Component, Instance};
use crate::config::Config;
use crate::db::{self, Db};
use crate::error::{CompgraphError, Result};
use crate::query::{self, Filters};
use crate::rel::{self, Direction, REL_NAME};

use traverse::{Children, Ctx, Node};

/// Relationship endpoints to link when creating a component.
#[derive(Debug, Clone, Default)]
pub struct Relations {
    /// Instances that relate *to* the new component (it becomes the target).
    pub upstream: Vec<Instance>,
    /// Instances the new component relates *to* (it becomes the source).
    pub downstream: Vec<Instance>,
}

impl Relations {
    pub fn new(upstream: Vec<Instance>, downstream: Vec<Instance>) -> Self {
        Self {
            upstream,
            downstream,
        }
    }

    pub fn upstream(upstream: Vec<Instance>) -> Self {
        Self {
            upstream,
            downstream: Vec::new(),
        }
    }

    pub fn downstream(downstream: Vec<Instance>) -> Self {
        Self {
            upstream: Vec::new(),
            downstream,
        }
    }
}

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Namespace prepended to every table name.
    pub table_prefix: String,
    /// Default upstream traversal depth when a `get` call sets none.
    pub upstream_limit: u32,
    /// Default downstream traversal depth when a `get` call sets none.
    pub downstream_limit: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            upstream_limit: 10,
            downstream_limit: 10,
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            table_prefix: config.table_prefix().to_string(),
            upstream_limit: config.engine.upstream_limit,
            downstream_limit: config.engine.downstream_limit,
        }
    }
}

struct Inner {
    prefix: String,
    upstream_limit: u32,
    downstream_limit: u32,
    registry: HashMap<String, Arc<dyn Component>>,
}

impl Inner {
    fn def(&self, name: &str) -> Result<&Arc<dyn Component>> {
        self.registry.get(name).ok_or_else(|| {
            CompgraphError::Validation(format!("unknown component: {:?}", name))
        })
    }
}

/// Relationship-aware data access engine over one SQLite database.
pub struct Engine {
    db: Db,
    inner: Arc<Inner>,
}

impl Engine {
    /// Register the component set, ensure every backing schema (including the
    /// shared edge table) exists, and return a ready engine.
    ///
    /// Fails with [`CompgraphError::SchemaConflict`] if a component reuses
    /// the reserved relation name or a name appears twice.
    pub async fn register(
        db: Db,
        options: EngineOptions,
        components: Vec<Arc<dyn Component>>,
    ) -> Result<Engine> {
        let mut registry: HashMap<String, Arc<dyn Component>> = HashMap::new();
        for component in &components {
            let name = component.name().to_string();
            if name == REL_NAME {
                return Err(CompgraphError::SchemaConflict(format!(
                    "{:?} is reserved for the relation table",
                    REL_NAME
                )));
            }
            if registry.insert(name.clone(), Arc::clone(component)).is_some() {
                return Err(CompgraphError::SchemaConflict(format!(
                    "component {:?} registered twice",
                    name
                )));
            }
        }

        let prefix = options.table_prefix.clone();
        let schema_components = components;
        db.with_connection(move |conn| {
            rel::ensure_schema(conn, &prefix)?;
            for component in &schema_components {
                component.ensure_schema(conn, &prefix)?;
            }
            Ok(())
        })
        .await?;
        log::info!(
            "registered {} components (prefix {:?})",
            registry.len(),
            options.table_prefix
        );

        Ok(Engine {
            db,
            inner: Arc::new(Inner {
                prefix: options.table_prefix,
                upstream_limit: options.upstream_limit,
                downstream_limit: options.downstream_limit,
                registry,
            }),
        })
    }

    /// Insert the component's row and link the given relations, all in one
    /// transaction. Returns the new row id.
    pub async fn create(&self, comp: Instance, relations: Relations) -> Result<i64> {
        let inner = Arc::clone(&self.inner);
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let id = create_in(&inner, &tx, &comp, &relations)?;
                tx.commit()?;
                Ok(id)
            })
            .await
    }

    /// Apply the patch's defined attributes to every row matching `target`.
    /// Returns the number of patched rows.
    pub async fn update(&self, target: Instance, patch: Instance) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let changed = update_in(&inner, &tx, &target, &patch)?;
                tx.commit()?;
                Ok(changed)
            })
            .await
    }

    /// Delete every row matching `comp` together with all incident edges.
    /// Returns the number of deleted rows.
    pub async fn del(&self, comp: Instance) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let deleted = del_in(&inner, &tx, &comp)?;
                tx.commit()?;
                Ok(deleted)
            })
            .await
    }

    /// Materialize the bounded-depth relationship tree around every row
    /// matching `comp`.
    pub async fn get(&self, comp: Instance, filters: Filters) -> Result<Json> {
        let inner = Arc::clone(&self.inner);
        self.db
            .with_connection(move |conn| get_in(&inner, conn, &comp, &filters))
            .await
    }

    /// Synchronous [`Engine::create`] core for composing into a
    /// caller-supplied transaction or connection.
    pub fn create_in(
        &self,
        conn: &Connection,
        comp: &Instance,
        relations: &Relations,
    ) -> Result<i64> {
        create_in(&self.inner, conn, comp, relations)
    }

    /// Synchronous [`Engine::update`] core.
    pub fn update_in(&self, conn: &Connection, target: &Instance, patch: &Instance) -> Result<usize> {
        update_in(&self.inner, conn, target, patch)
    }

    /// Synchronous [`Engine::del`] core.
    pub fn del_in(&self, conn: &Connection, comp: &Instance) -> Result<usize> {
        del_in(&self.inner, conn, comp)
    }

    /// Synchronous [`Engine::get`] core.
    pub fn get_in(&self, conn: &Connection, comp: &Instance, filters: &Filters) -> Result<Json> {
        get_in(&self.inner, conn, comp, filters)
    }
}

fn create_in(
    inner: &Inner,
    conn: &Connection,
    comp: &Instance,
    relations: &Relations,
) -> Result<i64> {
    let def = inner.def(comp.name())?;
    component::validate_against(comp, def.as_ref())?;
    for endpoint in relations.upstream.iter().chain(&relations.downstream) {
        let endpoint_def = inner.def(endpoint.name())?;
        component::validate_against(endpoint, endpoint_def.as_ref())?;
    }

    let compiled = query::compile_insert(&inner.prefix, comp)?;
    db::execute(conn, &compiled.sql, &compiled.params)?;
    let id = conn.last_insert_rowid();

    let created = Instance::new(comp.name()).with_id(id);
    rel::upsert_upstream_edges(conn, &inner.prefix, &created, &relations.upstream)?;
    rel::upsert_downstream_edges(conn, &inner.prefix, &created, &relations.downstream)?;
    Ok(id)
}

fn update_in(inner: &Inner, conn: &Connection, target: &Instance, patch: &Instance) -> Result<usize> {
    if target.name() != patch.name() {
        return Err(CompgraphError::Validation(format!(
            "update target {:?} and patch {:?} name different components",
            target.name(),
            patch.name()
        )));
    }
    let def = inner.def(target.name())?;
    component::validate_against(target, def.as_ref())?;
    component::validate_against(patch, def.as_ref())?;

    let select = query::compile_select(&inner.prefix, target, &Filters::rows_only())?;
    let rows = db::query_rows(conn, &select.sql, &select.params)?;
    let mut changed = 0;
    for row in rows {
        let Some(id) = row.get("id").and_then(Json::as_i64) else {
            continue;
        };
        let compiled = query::compile_update_by_id(&inner.prefix, patch, id)?;
        changed += db::execute(conn, &compiled.sql, &compiled.params)?;
    }
    Ok(changed)
}

fn del_in(inner: &Inner, conn: &Connection, comp: &Instance) -> Result<usize> {
    let def = inner.def(comp.name())?;
    component::validate_against(comp, def.as_ref())?;

    let select = query::compile_select(&inner.prefix, comp, &Filters::rows_only())?;
    let rows = db::query_rows(conn, &select.sql, &select.params)?;
    let mut deleted = 0;
    for row in rows {
        let Some(id) = row.get("id").and_then(Json::as_i64) else {
            continue;
        };
        rel::delete_edges_for(conn, &inner.prefix, comp.name(), id)?;
        let compiled = query::compile_delete_by_id(&inner.prefix, comp.name(), id)?;
        deleted += db::execute(conn, &compiled.sql, &compiled.params)?;
    }
    Ok(deleted)
}

fn get_in(inner: &Inner, conn: &Connection, comp: &Instance, filters: &Filters) -> Result<Json> {
    let def = inner.def(comp.name())?;
    component::validate_against(comp, def.as_ref())?;
    for filter in &filters.filter_upstream_by {
        let filter_def = inner.def(filter.name())?;
        component::validate_against(filter, filter_def.as_ref())?;
    }
    if let Some(group) = &filters.group {
        let group_def = inner.def(group.by.name())?;
        component::validate_against(&group.by, group_def.as_ref())?;
    }

    // Widen the caller's (possibly partial) instance onto the component's
    // full template so every column is projected.
    let mut root = def.instance();
    for (attr, value) in comp.defined_attrs() {
        root = root.set(attr, value.clone());
    }

    // Aggregate and grouped rows carry no discrete root ids to expand from
    let aggregate = !filters.aggregate.is_empty() || filters.group.is_some();
    let upstream_limit = if aggregate {
        0
    } else {
        filters.upstream_limit.unwrap_or(inner.upstream_limit)
    };
    let downstream_limit = if aggregate {
        0
    } else {
        filters.downstream_limit.unwrap_or(inner.downstream_limit)
    };

    let mut ctx = Ctx::new(conn, &inner.registry, &inner.prefix);

    let mut upstream = Vec::new();
    traverse::expand_root(
        &mut ctx,
        &root,
        &mut upstream,
        filters,
        upstream_limit,
        Direction::Upstream,
    )?;
    let mut downstream = Vec::new();
    traverse::expand_root(
        &mut ctx,
        &root,
        &mut downstream,
        filters,
        downstream_limit,
        Direction::Downstream,
    )?;

    let mut tree = Children::new();
    tree.insert(comp.name().to_string(), merge_root(upstream, downstream));
    resolve::resolve(&mut ctx, &mut tree)?;
    Ok(resolve::tree_to_json(&tree))
}

/// Merge the two directions' root lists. Both passes read the root rows
/// through the shared memo cache, so the lists are element-wise the same row
/// set; merging unions each pair's children instead of keeping two copies.
fn merge_root(mut upstream: Vec<Node>, downstream: Vec<Node>) -> Vec<Node> {
    for (i, mut down_node) in downstream.into_iter().enumerate() {
        match upstream.get_mut(i) {
            Some(up_node) => {
                let extra = std::mem::take(down_node.children_mut());
                for (name, nodes) in extra {
                    up_node.children_mut().entry(name).or_default().extend(nodes);
                }
            }
            None => upstream.push(down_node),
        }
    }
    upstream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentDef;
    use crate::query::{Aggregate, Group, OrderKey};
    use serde_json::json;
    use tempfile::TempDir;

    fn components() -> Vec<Arc<dyn Component>> {
        vec![
            Arc::new(
                ComponentDef::new("user")
                    .text("username")
                    .not_null()
                    .text("email")
                    .not_null()
                    .unique(&["email"]),
            ),
            Arc::new(ComponentDef::new("post").text("content").not_null()),
            Arc::new(ComponentDef::new("topic").text("title").not_null()),
        ]
    }

    async fn test_engine() -> (Engine, Db, TempDir) {
        let _ = env_logger::builder().is_test(true).try_init();
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let engine = Engine::register(Db::new(&db_path), EngineOptions::default(), components())
            .await
            .unwrap();
        // Second handle for raw row access in assertions
        (engine, Db::new(&db_path), temp_dir)
    }

    fn user(username: &str, email: &str) -> Instance {
        Instance::new("user")
            .set("username", username)
            .set("email", email)
    }

    fn post(content: &str) -> Instance {
        Instance::new("post").set("content", content)
    }

    fn topic(title: &str) -> Instance {
        Instance::new("topic").set("title", title)
    }

    /// user(1) authored post(1); topic(1) contains post(1) downstream and is
    /// started by user(1) upstream.
    async fn seed_forum(engine: &Engine) {
        engine
            .create(user("Asuka", "asuka@localhost"), Relations::default())
            .await
            .unwrap();
        engine
            .create(
                post("Post 1"),
                Relations::upstream(vec![Instance::new("user")
                    .with_id(1)
                    .with_rel_type("author")]),
            )
            .await
            .unwrap();
        engine
            .create(
                topic("Topic 1"),
                Relations::new(
                    vec![Instance::new("user").with_id(1)],
                    vec![Instance::new("post").with_id(1)],
                ),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let (engine, _db, _tmp) = test_engine().await;
        let id = engine
            .create(user("Asuka", "asuka@localhost"), Relations::default())
            .await
            .unwrap();
        assert_eq!(id, 1);

        let tree = engine
            .get(Instance::new("user").with_id(1), Filters::default())
            .await
            .unwrap();
        assert_eq!(tree["user"][0]["self"]["id"], json!(1));
        assert_eq!(tree["user"][0]["self"]["username"], json!("Asuka"));
        assert_eq!(tree["user"][0]["self"]["email"], json!("asuka@localhost"));
        assert!(tree["user"][0]["self"]["created_at"].is_string());
    }

    #[tokio::test]
    async fn test_post_with_upstream_author() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;

        let tree = engine
            .get(Instance::new("post").with_id(1), Filters::default())
            .await
            .unwrap();
        assert_eq!(tree["post"][0]["self"]["content"], json!("Post 1"));
        assert_eq!(tree["post"][0]["user"][0]["self"]["username"], json!("Asuka"));
        assert_eq!(tree["post"][0]["user"][0]["self"]["relType"], json!("author"));
    }

    #[tokio::test]
    async fn test_topic_with_upstream_and_downstream() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;

        let tree = engine
            .get(Instance::new("topic").with_id(1), Filters::default())
            .await
            .unwrap();
        assert_eq!(tree["topic"][0]["self"]["title"], json!("Topic 1"));
        assert_eq!(tree["topic"][0]["user"][0]["self"]["username"], json!("Asuka"));
        assert_eq!(tree["topic"][0]["post"][0]["self"]["content"], json!("Post 1"));
    }

    #[tokio::test]
    async fn test_root_list_never_doubled() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;

        // Both traversal directions enter the root component's list; the
        // merged tree must contain each true root row exactly once.
        let tree = engine
            .get(Instance::new("post"), Filters::default())
            .await
            .unwrap();
        assert_eq!(tree["post"].as_array().unwrap().len(), 1);

        let tree = engine
            .get(Instance::new("user"), Filters::default())
            .await
            .unwrap();
        assert_eq!(tree["user"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_depth_bounding() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;

        // At limit 1 the topic above the post appears, but the user above
        // that topic (two hops) must not.
        let tree = engine
            .get(
                Instance::new("post").with_id(1),
                Filters {
                    upstream_limit: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let topic_node = &tree["post"][0]["topic"][0];
        assert_eq!(topic_node["self"]["title"], json!("Topic 1"));
        assert!(topic_node.get("user").is_none());

        // Unlimited default shows the two-hop user
        let tree = engine
            .get(Instance::new("post").with_id(1), Filters::default())
            .await
            .unwrap();
        assert_eq!(
            tree["post"][0]["topic"][0]["user"][0]["self"]["username"],
            json!("Asuka")
        );
    }

    #[tokio::test]
    async fn test_downstream_depth_bounding() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;

        let tree = engine
            .get(
                Instance::new("topic").with_id(1),
                Filters {
                    downstream_limit: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(tree["topic"][0].get("post").is_none());
        // Upstream side is unaffected
        assert_eq!(tree["topic"][0]["user"][0]["self"]["username"], json!("Asuka"));
    }

    #[tokio::test]
    async fn test_filter_upstream_by_is_intersection() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;
        engine
            .create(user("Katniss", "katniss@localhost"), Relations::default())
            .await
            .unwrap();
        // post 2 relates to user 2 only; post 1 relates to user 1 and topic 1
        engine
            .create(
                post("Post 2"),
                Relations::upstream(vec![Instance::new("user").with_id(2)]),
            )
            .await
            .unwrap();
        engine
            .create(
                post("Post 3"),
                Relations::upstream(vec![
                    Instance::new("user").with_id(1),
                    Instance::new("topic").with_id(1),
                ]),
            )
            .await
            .unwrap();

        let tree = engine
            .get(
                Instance::new("post"),
                Filters {
                    filter_upstream_by: vec![
                        Instance::new("user").with_id(1),
                        Instance::new("topic").with_id(1),
                    ],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Only posts related to BOTH user 1 and topic 1: post 1 (via seed)
        // and post 3. Post 2 relates to neither, and a post related to only
        // one of the two must not appear.
        let posts = tree["post"].as_array().unwrap();
        let contents: Vec<&str> = posts
            .iter()
            .map(|p| p["self"]["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["Post 1", "Post 3"]);
    }

    #[tokio::test]
    async fn test_filter_upstream_by_needs_key() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;
        let result = engine
            .get(
                Instance::new("post"),
                Filters {
                    filter_upstream_by: vec![Instance::new("user")],
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(CompgraphError::MissingFilterKey(_))));
    }

    #[tokio::test]
    async fn test_order_and_limit() {
        let (engine, _db, _tmp) = test_engine().await;
        for n in 1..=3 {
            engine
                .create(post(&format!("Post {}", n)), Relations::default())
                .await
                .unwrap();
        }
        let tree = engine
            .get(
                Instance::new("post"),
                Filters {
                    order_by: vec![OrderKey::desc("id")],
                    limit: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let posts = tree["post"].as_array().unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0]["self"]["content"], json!("Post 3"));
        assert_eq!(posts[1]["self"]["content"], json!("Post 2"));
    }

    #[tokio::test]
    async fn test_aggregate_count_disables_fan_out() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;
        engine
            .create(post("Post 2"), Relations::default())
            .await
            .unwrap();

        let tree = engine
            .get(
                Instance::new("post"),
                Filters {
                    aggregate: vec![Aggregate::new("count", "*")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let nodes = tree["post"].as_array().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0]["aggregate"]["count"], json!(2));
        // No self tag and no children on aggregate rows
        assert!(nodes[0].get("self").is_none());
        assert!(nodes[0].get("user").is_none());
    }

    #[tokio::test]
    async fn test_group_posts_by_author() {
        let (engine, _db, _tmp) = test_engine().await;
        engine
            .create(user("Asuka", "asuka@localhost"), Relations::default())
            .await
            .unwrap();
        engine
            .create(user("Katniss", "katniss@localhost"), Relations::default())
            .await
            .unwrap();
        for (content, author) in [("Post 1", 1), ("Post 2", 1), ("Post 3", 2)] {
            engine
                .create(
                    post(content),
                    Relations::upstream(vec![Instance::new("user").with_id(author)]),
                )
                .await
                .unwrap();
        }

        let tree = engine
            .get(
                Instance::new("post"),
                Filters {
                    aggregate: vec![Aggregate::new("count", "*")],
                    group: Some(Group {
                        by: Instance::new("user"),
                        columns: vec!["username".to_string()],
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let rows = tree["post"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        let by_name: HashMap<&str, i64> = rows
            .iter()
            .map(|r| {
                (
                    r["aggregate"]["username"].as_str().unwrap(),
                    r["aggregate"]["count"].as_i64().unwrap(),
                )
            })
            .collect();
        assert_eq!(by_name["Asuka"], 2);
        assert_eq!(by_name["Katniss"], 1);
    }

    #[tokio::test]
    async fn test_group_without_aggregate_has_no_children() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;

        // Grouping alone is legal without an aggregate fn. The grouped rows
        // are projections of the `by` component; an `id` column in one must
        // not be mistaken for a root row id and expanded.
        let tree = engine
            .get(
                Instance::new("post"),
                Filters {
                    group: Some(Group {
                        by: Instance::new("user"),
                        columns: vec!["id".to_string()],
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let rows = tree["post"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["aggregate"]["id"], json!(1));
        assert!(rows[0].get("self").is_none());
        assert!(rows[0].get("user").is_none());
        assert!(rows[0].get("topic").is_none());
    }

    #[tokio::test]
    async fn test_update_patches_matching_rows() {
        let (engine, _db, _tmp) = test_engine().await;
        seed_forum(&engine).await;

        let changed = engine
            .update(
                Instance::new("post").with_id(1),
                Instance::new("post").set("content", "Post 1 (edited)"),
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let tree = engine
            .get(Instance::new("post").with_id(1), Filters::default())
            .await
            .unwrap();
        assert_eq!(tree["post"][0]["self"]["content"], json!("Post 1 (edited)"));
    }

    #[tokio::test]
    async fn test_delete_cascades_edges() {
        let (engine, db, _tmp) = test_engine().await;
        seed_forum(&engine).await;

        let deleted = engine.del(Instance::new("post").with_id(1)).await.unwrap();
        assert_eq!(deleted, 1);

        let tree = engine
            .get(Instance::new("post").with_id(1), Filters::default())
            .await
            .unwrap();
        assert_eq!(tree["post"], json!([]));

        // No edge may mention the deleted post in either direction
        let incident: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM rel \
                     WHERE (source_comp = 'post' AND source_id = 1) \
                        OR (target_comp = 'post' AND target_id = 1)",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(incident, 0);
    }

    #[tokio::test]
    async fn test_dangling_reference_leaves_stub() {
        let (engine, db, _tmp) = test_engine().await;
        seed_forum(&engine).await;
        // Remove the author row behind the engine's back
        db.with_connection(|conn| {
            conn.execute("DELETE FROM user WHERE id = 1", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let tree = engine
            .get(Instance::new("post").with_id(1), Filters::default())
            .await
            .unwrap();
        let stub = &tree["post"][0]["user"][0];
        assert_eq!(stub["unresolved"], json!("user"));
        assert_eq!(stub["id"], json!(1));
        assert_eq!(stub["relType"], json!("author"));
        assert!(stub.get("self").is_none());
    }

    #[tokio::test]
    async fn test_reserved_name_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));
        let mut comps = components();
        comps.push(Arc::new(ComponentDef::new("rel").text("nope")));
        let result = Engine::register(db, EngineOptions::default(), comps).await;
        assert!(matches!(result, Err(CompgraphError::SchemaConflict(_))));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));
        let mut comps = components();
        comps.push(Arc::new(ComponentDef::new("user").text("username")));
        let result = Engine::register(db, EngineOptions::default(), comps).await;
        assert!(matches!(result, Err(CompgraphError::SchemaConflict(_))));
    }

    #[tokio::test]
    async fn test_unknown_component_rejected_before_storage() {
        let (engine, _db, _tmp) = test_engine().await;
        let result = engine
            .get(Instance::new("ghost"), Filters::default())
            .await;
        assert!(matches!(result, Err(CompgraphError::Validation(_))));

        let result = engine
            .create(Instance::new("ghost").set("x", 1), Relations::default())
            .await;
        assert!(matches!(result, Err(CompgraphError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_relation_endpoint_rolls_back() {
        let (engine, _db, _tmp) = test_engine().await;
        let result = engine
            .create(
                post("orphan"),
                Relations::upstream(vec![Instance::new("user").with_id(42)]),
            )
            .await;
        assert!(matches!(result, Err(CompgraphError::Validation(_))));

        // The transaction rolled back: no post row was left behind
        let tree = engine
            .get(Instance::new("post"), Filters::default())
            .await
            .unwrap();
        assert_eq!(tree["post"], json!([]));
    }

    #[tokio::test]
    async fn test_caller_supplied_connection() {
        let (engine, db, _tmp) = test_engine().await;
        let conn = db.open_connection().unwrap();
        let id = engine
            .create_in(
                &conn,
                &user("Asuka", "asuka@localhost"),
                &Relations::default(),
            )
            .unwrap();
        let tree = engine
            .get_in(&conn, &Instance::new("user").with_id(id), &Filters::default())
            .unwrap();
        assert_eq!(tree["user"][0]["self"]["username"], json!("Asuka"));
    }
}
