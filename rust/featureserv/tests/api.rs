mod support;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use serial_test::serial;
use support::{encode, read_json, read_text, with_feature_harness, SERVICE_PATH};

const JAN_2001_MS: i64 = 978_307_200_000;
const JAN_2005_MS: i64 = 1_104_537_600_000;
const JAN_2012_MS: i64 = 1_325_376_000_000;
const JAN_2020_MS: i64 = 1_577_836_800_000;

fn layer_path(operation: &str) -> String {
    format!("{SERVICE_PATH}/0/{operation}")
}

fn query_string(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn object_ids(body: &Value) -> Vec<i64> {
    body["features"]
        .as_array()
        .expect("features should be an array")
        .iter()
        .map(|feature| feature["attributes"]["db_id"].as_i64().expect("db_id"))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn health_endpoint_reports_ok() {
    with_feature_harness(|harness| async move {
        let (status, body) = read_json(harness.get("/healthz", "").await).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn service_metadata_lists_layers() {
    with_feature_harness(|harness| async move {
        let (status, body) = read_json(harness.get(SERVICE_PATH, "f=json").await).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(body["currentVersion"], json!(10.2));
        assert_eq!(body["description"], json!("Groundwater wells"));
        assert_eq!(
            body["layers"],
            json!([{"id": 0, "name": "Wells", "minScale": 0, "maxScale": 0}])
        );

        let (status, body) =
            read_json(harness.get("/rest/services/nope/FeatureServer", "").await).await;
        assert_eq!(status, http::StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("NOT_FOUND"));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn layer_metadata_reads_live_schema() {
    with_feature_harness(|harness| async move {
        let (status, body) = read_json(harness.get(&format!("{SERVICE_PATH}/0"), "").await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(body["objectIdField"], json!("db_id"));
        assert_eq!(body["fields"][0]["type"], json!("esriFieldTypeOID"));
        assert_eq!(body["fields"][1]["type"], json!("esriFieldTypeString"));
        assert_eq!(body["relatedTables"][0]["name"], json!("samples"));
        assert_eq!(
            body["timeInfo"]["timeExtent"],
            json!([JAN_2001_MS, JAN_2012_MS])
        );
        assert_eq!(body["extent"]["xmin"], json!(-900.0));
        assert_eq!(body["extent"]["ymax"], json!(1600.0));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn where_and_order_shape_the_feature_set() {
    with_feature_harness(|harness| async move {
        let query = query_string(&[
            ("where", "depth > 20"),
            ("outFields", "name"),
            ("orderByFields", "depth DESC"),
        ]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(object_ids(&body), vec![4, 3, 2]);
        assert_eq!(body["exceededTransferLimit"], json!(false));
        assert_eq!(body["geometryType"], json!("esriGeometryPoint"));
        assert_eq!(body["spatialReference"], json!({"wkid": 3857}));
        assert_eq!(body["features"][1]["attributes"]["name"], json!("Gamma"));
        assert_eq!(
            body["features"][0]["geometry"],
            json!({"x": 100.0, "y": 200.0})
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn limit_reports_exceeded_transfer() {
    with_feature_harness(|harness| async move {
        let query = query_string(&[
            ("where", "db_id > 0"),
            ("orderByFields", "db_id"),
            ("resultRecordCount", "2"),
        ]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(object_ids(&body), vec![1, 2]);
        assert_eq!(body["exceededTransferLimit"], json!(true));

        let query = query_string(&[
            ("where", "db_id > 0"),
            ("orderByFields", "db_id"),
            ("limit", "2"),
            ("offset", "2"),
        ]);
        let (_, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(object_ids(&body), vec![3, 4]);
        assert_eq!(body["exceededTransferLimit"], json!(false));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn ids_and_counts() {
    with_feature_harness(|harness| async move {
        let query = query_string(&[("where", "db_id > 0"), ("returnIdsOnly", "true")]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(
            body,
            json!({
                "count": 4,
                "exceededTransferLimit": false,
                "objectIdFieldName": "db_id",
                "objectIds": [1, 2, 3, 4]
            })
        );

        let query = query_string(&[("where", "depth > 20"), ("returnCountOnly", "true")]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(body, json!({"count": 3}));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn bad_where_clauses_are_rejected() {
    with_feature_harness(|harness| async move {
        let query = query_string(&[("where", "1=1; DROP TABLE db_wells")]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("INVALID_SQL"));

        let query = query_string(&[("where", "nonexistent_col = 1")]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("INVALID_FIELDS"));
        assert_eq!(body["fields"], json!(["nonexistent_col"]));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn object_id_queries_nest_related_rows() {
    with_feature_harness(|harness| async move {
        let query = query_string(&[("objectIds", "1"), ("outFields", "*,samples.*")]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(object_ids(&body), vec![1]);

        let samples = body["features"][0]["related"]["samples"]
            .as_array()
            .expect("related samples");
        let mut ph: Vec<f64> = samples
            .iter()
            .map(|sample| sample["ph"].as_f64().expect("ph"))
            .collect();
        ph.sort_by(f64::total_cmp);
        assert_eq!(ph, vec![6.8, 7.1]);
        assert!(samples.iter().all(|sample| sample["site_id"] == json!(10)));
        assert!(body["relatedFields"]["samples"].is_array());

        // Ids alone still leave a time-enabled layer on its first step.
        let query = query_string(&[("objectIds", "1,2")]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(object_ids(&body), vec![1]);

        let query = query_string(&[("outFields", "samples.ph")]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("RELATED_FIELDS"));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn spatial_and_time_filters() {
    with_feature_harness(|harness| async move {
        let query = query_string(&[
            ("where", "db_id > 0"),
            ("geometry", "0,0,200,300"),
            ("orderByFields", "db_id"),
        ]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(object_ids(&body), vec![1, 4]);

        let time = format!("{JAN_2001_MS},{JAN_2005_MS}");
        let query = query_string(&[("time", &time)]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(object_ids(&body), vec![1]);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn csv_export_pages_without_repeating_header() {
    with_feature_harness(|harness| async move {
        let query = query_string(&[
            ("f", "csv"),
            ("where", "db_id > 0"),
            ("outFields", "name"),
            ("orderByFields", "db_id"),
            ("returnGeometry", "false"),
        ]);
        let response = harness.get(&layer_path("query"), &query).await;
        assert_eq!(response.headers()[http::header::CONTENT_TYPE], "text/csv");
        let (status, text) = read_text(response).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(text, "db_id,name\n1,Alpha\n2,Beta\n3,Gamma\n4,\n");

        let query = query_string(&[
            ("f", "csv"),
            ("where", "db_id > 0"),
            ("outFields", "name"),
            ("orderByFields", "db_id"),
            ("offset", "2"),
        ]);
        let (_, text) = read_text(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(text, "3,Gamma,500,600\n4,,100,200\n");
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn renderers_classify_live_values() {
    with_feature_harness(|harness| async move {
        let query = query_string(&[(
            "classificationDef",
            r#"{"type":"uniqueValueDef","uniqueValueFields":["name"]}"#,
        )]);
        let (status, body) =
            read_json(harness.get(&layer_path("generateRenderer"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(
            body,
            json!({
                "type": "uniqueValue",
                "field1": "name",
                "uniqueValueInfos": [{"value": "Alpha"}, {"value": "Beta"}, {"value": "Gamma"}]
            })
        );

        let response = harness
            .post_form(
                &layer_path("generateRenderer"),
                &[(
                    "classificationDef",
                    r#"{"type":"classBreaksDef","classificationField":"depth","classificationMethod":"esriClassifyEqualInterval","breakCount":2}"#,
                )],
                false,
            )
            .await;
        let (status, body) = read_json(response).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(body["minValue"], json!(10.0));
        assert_eq!(
            body["classBreakInfos"],
            json!([
                {"classMinValue": 10.0, "classMaxValue": 32.5},
                {"classMinValue": 32.5, "classMaxValue": 55.0}
            ])
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn time_query_counts_per_location() {
    with_feature_harness(|harness| async move {
        let (status, body) = read_json(harness.get(&layer_path("time-query"), "").await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(body["count"], json!(3));
        assert_eq!(body["fields"][0]["name"], json!("count"));

        let mut counts: Vec<(f64, i64)> = body["features"]
            .as_array()
            .expect("features")
            .iter()
            .map(|feature| {
                (
                    feature["geometry"]["x"].as_f64().expect("x"),
                    feature["attributes"]["count"].as_i64().expect("count"),
                )
            })
            .collect();
        counts.sort_by(|a, b| a.0.total_cmp(&b.0));
        assert_eq!(counts, vec![(100.0, 2), (300.0, 1), (500.0, 1)]);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn apply_edits_requires_api_key() {
    with_feature_harness(|harness| async move {
        let response = harness
            .post_form(&layer_path("applyEdits"), &[("deletes", "1")], false)
            .await;
        let (status, body) = read_json(response).await;
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], json!("authentication failed"));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn apply_edits_reports_each_item() {
    with_feature_harness(|harness| async move {
        let adds = json!([
            {
                "attributes": {"name": "Delta", "depth": 5, "site_id": 12, "drilled": JAN_2020_MS},
                "geometry": {"x": 700, "y": 800, "spatialReference": {"wkid": 3857}}
            },
            {"attributes": {"name": "Broken"}}
        ])
        .to_string();
        let updates = json!([{"attributes": {"db_id": 2, "name": "Beta 2"}}]).to_string();

        let response = harness
            .post_form(
                &layer_path("applyEdits"),
                &[
                    ("adds", &adds),
                    ("updates", &updates),
                    ("deletes", "3,99"),
                ],
                true,
            )
            .await;
        let (status, body) = read_json(response).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(
            body["addResults"],
            json!([
                {"objectId": 5, "success": true},
                {
                    "success": false,
                    "error": {"code": -999999, "description": "Missing attributes depth,site_id,drilled"}
                }
            ])
        );
        assert_eq!(body["updateResults"], json!([{"objectId": 2, "success": true}]));
        assert_eq!(body["deleteResults"][0], json!({"objectId": 3, "success": true}));
        assert_eq!(body["deleteResults"][1]["success"], json!(false));
        assert_eq!(body["newTimeExtent"], json!([JAN_2001_MS, JAN_2020_MS]));

        let query = query_string(&[
            ("objectIds", "2,3,5"),
            ("where", "db_id > 0"),
            ("orderByFields", "db_id"),
        ]);
        let (status, body) = read_json(harness.get(&layer_path("query"), &query).await).await;
        assert_eq!(status, http::StatusCode::OK, "{body}");
        assert_eq!(object_ids(&body), vec![2, 5]);
        assert_eq!(body["features"][0]["attributes"]["name"], json!("Beta 2"));
        assert_eq!(body["features"][1]["attributes"]["drilled"], json!("2020-01-01"));
        assert_eq!(
            body["features"][1]["geometry"],
            json!({"x": 700.0, "y": 800.0})
        );
    })
    .await;
}
