//! End-to-end relation propagation
//!
//! Two services share one context: `mock-records`, and
//! `recordwithrelations` whose records embed a `mock-records` relation at
//! `inner_record`. Changing the referenced record must show up in the
//! store right away and in the index only after the bulk queue is drained.

use relindex_storage::{BulkQueue, InMemoryBulkQueue, InMemoryRecordStore};
use relindex_sync::{
    Identity, MemoryIndex, RecordService, SearchParams, ServiceContext, SyncConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn build_service(ctx: &ServiceContext, config: SyncConfig) -> RecordService {
    let record_type = config.record_type.clone();
    RecordService::new(
        config,
        ctx.clone(),
        Arc::new(InMemoryRecordStore::new(record_type)),
        Arc::new(InMemoryBulkQueue::new()),
        Arc::new(MemoryIndex::new()),
    )
    .expect("service config is valid")
}

fn services() -> (ServiceContext, RecordService, RecordService) {
    let ctx = ServiceContext::new();
    let service = build_service(&ctx, SyncConfig::new("mock-records", "mock-records"));
    let service_wrel = build_service(
        &ctx,
        SyncConfig::new("recordwithrelations", "recordwithrelations")
            .with_relation("mock-records", ["inner_record"]),
    );
    // Done at startup in a deployment
    service_wrel.register_relation_subscribers();
    (ctx, service, service_wrel)
}

fn input_data(title: &str) -> Value {
    json!({ "title": title, "type": { "type": "test" } })
}

async fn assert_record_from_store_and_index(
    identity: &Identity,
    service: &RecordService,
    pid: &str,
    inner_pid: &str,
    title_store: &str,
    title_index: &str,
) {
    let from_store = service.read(identity, pid).await.unwrap();
    assert_eq!(from_store.metadata()["inner_record"]["id"], inner_pid);
    assert_eq!(
        from_store.metadata()["inner_record"]["metadata"]["title"],
        title_store
    );

    let from_index = service
        .search(identity, &SearchParams::query(pid))
        .await
        .unwrap();
    assert_eq!(from_index.total, 1);
    let hit = &from_index.hits[0];
    assert_eq!(hit["metadata"]["inner_record"]["id"], inner_pid);
    assert_eq!(hit["metadata"]["inner_record"]["metadata"]["title"], title_index);
}

#[tokio::test]
async fn test_relation_update_propagation() {
    let (_ctx, service, service_wrel) = services();
    let identity = Identity::new("user-1");

    let item = service
        .create(&identity, input_data("A title"))
        .await
        .unwrap();
    let inner_pid = item.pid().to_string();

    let mut wrel_data = input_data("With relation");
    wrel_data["inner_record"] = json!({ "id": inner_pid });
    let rec_one = service_wrel.create(&identity, wrel_data.clone()).await.unwrap();
    let rec_two = service_wrel.create(&identity, wrel_data.clone()).await.unwrap();

    for rec in [&rec_one, &rec_two] {
        assert_record_from_store_and_index(
            &identity,
            &service_wrel,
            rec.pid(),
            &inner_pid,
            "A title",
            "A title",
        )
        .await;
    }

    // Update the referenced record
    service
        .update(&identity, &inner_pid, input_data("new title"))
        .await
        .unwrap();
    let read_item = service.read(&identity, &inner_pid).await.unwrap();
    assert_eq!(read_item.metadata()["title"], "new title");

    // Updating rec_two reindexes it directly
    service_wrel
        .update(&identity, rec_two.pid(), wrel_data.clone())
        .await
        .unwrap();

    // rec_one: store resolves the new title, index is stale
    assert_record_from_store_and_index(
        &identity,
        &service_wrel,
        rec_one.pid(),
        &inner_pid,
        "new title",
        "A title",
    )
    .await;
    assert_record_from_store_and_index(
        &identity,
        &service_wrel,
        rec_two.pid(),
        &inner_pid,
        "new title",
        "new title",
    )
    .await;

    // Drain the queue (a background worker in a deployment)
    let outcome = service_wrel.indexer().process_bulk_queue().await.unwrap();
    assert_eq!(outcome.as_tuple(), (2, 0));

    for rec in [&rec_one, &rec_two] {
        assert_record_from_store_and_index(
            &identity,
            &service_wrel,
            rec.pid(),
            &inner_pid,
            "new title",
            "new title",
        )
        .await;
    }
}

#[tokio::test]
async fn test_unrelated_documents_are_not_queued() {
    let (_ctx, service, service_wrel) = services();
    let identity = Identity::system();

    let referenced = service.create(&identity, input_data("Referenced")).await.unwrap();
    let other = service.create(&identity, input_data("Other")).await.unwrap();

    let mut data = input_data("With relation");
    data["inner_record"] = json!({ "id": referenced.pid() });
    service_wrel.create(&identity, data).await.unwrap();

    service
        .update(&identity, other.pid(), input_data("Other, edited"))
        .await
        .unwrap();
    assert!(service_wrel.indexer().queue().is_empty().await.unwrap());
    assert_eq!(
        service_wrel.indexer().process_bulk_queue().await.unwrap().as_tuple(),
        (0, 0)
    );
}

#[tokio::test]
async fn test_deleted_relation_degrades_to_stub() {
    let (_ctx, service, service_wrel) = services();
    let identity = Identity::system();

    let item = service.create(&identity, input_data("Doomed")).await.unwrap();
    let mut data = input_data("With relation");
    data["inner_record"] = json!({ "id": item.pid() });
    let rec = service_wrel.create(&identity, data).await.unwrap();

    service.delete(&identity, item.pid()).await.unwrap();

    // Store read degrades immediately
    let from_store = service_wrel.read(&identity, rec.pid()).await.unwrap();
    assert_eq!(from_store.metadata()["inner_record"], json!({ "id": item.pid() }));

    // Index catches up after the drain
    assert_eq!(
        service_wrel.indexer().process_bulk_queue().await.unwrap().as_tuple(),
        (1, 0)
    );
    let hits = service_wrel
        .search(&identity, &SearchParams::query(rec.pid()))
        .await
        .unwrap();
    assert_eq!(hits.hits[0]["metadata"]["inner_record"], json!({ "id": item.pid() }));
}

#[tokio::test]
async fn test_relation_update_across_many_referencing_records() {
    let ctx = ServiceContext::new();
    let service = build_service(&ctx, SyncConfig::new("mock-records", "mock-records"));
    let service_wrel = build_service(
        &ctx,
        SyncConfig::new("recordwithrelations", "recordwithrelations")
            .with_relation("mock-records", ["inner_record", "extra.refs"]),
    );
    service_wrel.register_relation_subscribers();
    let identity = Identity::system();

    let item = service.create(&identity, input_data("Shared")).await.unwrap();
    for i in 0..12 {
        let data = if i % 2 == 0 {
            json!({ "title": format!("R{}", i), "inner_record": { "id": item.pid() } })
        } else {
            json!({ "title": format!("R{}", i), "extra": { "refs": [{ "id": item.pid() }] } })
        };
        service_wrel.create(&identity, data).await.unwrap();
    }

    service
        .update(&identity, item.pid(), input_data("Shared v2"))
        .await
        .unwrap();
    assert_eq!(
        service_wrel.indexer().process_bulk_queue().await.unwrap().as_tuple(),
        (12, 0)
    );

    let all = service_wrel
        .search(&identity, &SearchParams::default().with_page(1, 50))
        .await
        .unwrap();
    assert_eq!(all.total, 12);
    for hit in &all.hits {
        let title = hit["metadata"]["inner_record"]["metadata"]["title"]
            .as_str()
            .or_else(|| hit["metadata"]["extra"]["refs"][0]["metadata"]["title"].as_str());
        assert_eq!(title, Some("Shared v2"));
    }
}

#[tokio::test]
async fn test_rebuild_index_restores_documents() {
    let (_ctx, service, _service_wrel) = services();
    let identity = Identity::system();

    for title in ["A", "B", "C"] {
        service.create(&identity, input_data(title)).await.unwrap();
    }
    assert_eq!(service.rebuild_index(&identity).await.unwrap(), 3);
    assert_eq!(
        service.indexer().process_bulk_queue().await.unwrap().as_tuple(),
        (3, 0)
    );
}

#[tokio::test]
async fn test_nested_relation_update_reaches_outer_documents() {
    let ctx = ServiceContext::new();
    let leaf = build_service(&ctx, SyncConfig::new("leaf-records", "leaf-records"));
    let middle = build_service(
        &ctx,
        SyncConfig::new("mid-records", "mid-records").with_relation("leaf-records", ["inner"]),
    );
    let outer = build_service(
        &ctx,
        SyncConfig::new("outer-records", "outer-records").with_relation("mid-records", ["mid"]),
    );
    assert_eq!(middle.register_relation_subscribers(), 1);
    assert_eq!(outer.register_relation_subscribers(), 2);
    let identity = Identity::system();

    let a = leaf.create(&identity, input_data("old")).await.unwrap();
    let mut b_data = input_data("middle");
    b_data["inner"] = json!({ "id": a.pid() });
    let b = middle.create(&identity, b_data).await.unwrap();
    let mut c_data = input_data("outer");
    c_data["mid"] = json!({ "id": b.pid() });
    let c = outer.create(&identity, c_data).await.unwrap();

    let nested_title = |hit: &Value| hit["metadata"]["mid"]["metadata"]["inner"]["metadata"]["title"].clone();
    let hits = outer.search(&identity, &SearchParams::query(c.pid())).await.unwrap();
    assert_eq!(nested_title(&hits.hits[0]), "old");

    leaf.update(&identity, a.pid(), input_data("new")).await.unwrap();

    assert_eq!(middle.indexer().process_bulk_queue().await.unwrap().as_tuple(), (1, 0));
    assert_eq!(outer.indexer().process_bulk_queue().await.unwrap().as_tuple(), (1, 0));

    let hits = outer.search(&identity, &SearchParams::query(c.pid())).await.unwrap();
    assert_eq!(hits.total, 1);
    assert_eq!(nested_title(&hits.hits[0]), "new");
    let hits = middle.search(&identity, &SearchParams::query(b.pid())).await.unwrap();
    assert_eq!(hits.hits[0]["metadata"]["inner"]["metadata"]["title"], "new");
}
