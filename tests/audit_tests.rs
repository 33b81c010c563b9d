mod common;

use common::MockEs;
use es_admin::audit::{run_audit, AuditOptions};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

fn respond(es: &MockEs, route: &str, body: Value) {
    es.mount(
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body)),
    );
}

#[test]
fn report_covers_cluster_indices_and_policies() {
    let es = MockEs::start();
    respond(&es, "/", json!({ "cluster_name": "prod", "version": { "number": "8.11.0" } }));
    respond(&es, "/_cluster/health", json!({ "status": "yellow", "number_of_nodes": 1 }));
    respond(
        &es,
        "/_cat/indices/*",
        json!([{
            "index": "orders",
            "health": "yellow",
            "status": "open",
            "pri": "1",
            "rep": "0",
            "store.size": "1048576",
            "docs.count": "100",
            "creation.date": "1700000000000"
        }]),
    );
    respond(&es, "/_cat/aliases", json!([]));
    respond(
        &es,
        "/orders/_mapping",
        json!({ "orders": { "mappings": { "properties": { "title": { "type": "text" } } } } }),
    );
    respond(&es, "/orders/_settings", json!({ "orders": { "settings": { "index.number_of_shards": "1" } } }));
    respond(
        &es,
        "/orders/_stats/docs",
        json!({ "indices": { "orders": { "primaries": { "docs": { "count": 100, "deleted": 50 } } } } }),
    );
    respond(&es, "/_index_template", json!({ "index_templates": [] }));
    respond(
        &es,
        "/_nodes/stats/jvm",
        json!({ "nodes": { "n1": { "name": "node-1", "jvm": { "mem": {
            "heap_used_in_bytes": 90, "heap_max_in_bytes": 100
        } } } } }),
    );
    respond(&es, "/_ilm/policy", json!({}));
    respond(
        &es,
        "/*/_settings/index.lifecycle.name",
        json!({ "orders": { "settings": {} } }),
    );

    let report = run_audit(&es.client(), &AuditOptions { index: "*".to_string() }).unwrap();
    let text = report.to_string();

    assert_eq!(report.indices, 1);
    assert!(text.contains("Cluster name: prod"));
    assert!(text.contains("Status: yellow"));
    assert!(text.contains("Index: orders"));
    assert!(text.contains("no replicas"));
    assert!(text.contains("non-standard index name"));
    assert!(text.contains("dynamic mapping enabled"));
    assert!(text.contains("text field 'title' has no keyword sub-field"));
    assert!(text.contains("many documents marked as deleted: 50"));
    assert!(text.contains("cluster status is yellow"));
    assert!(text.contains("high JVM heap usage on node node-1: 90.0%"));
    assert!(text.contains("No lifecycle policies"));
    assert!(text.contains("1 indices without a lifecycle policy"));
    assert!(report.issues > 0);
}

#[test]
fn blank_pattern_is_rejected() {
    let es = MockEs::start();
    assert!(run_audit(&es.client(), &AuditOptions { index: " ".to_string() }).is_err());
    assert!(es.calls().is_empty());
}
