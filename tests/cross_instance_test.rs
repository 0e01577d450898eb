mod common;

use std::time::{Duration, Instant};

use serde_json::json;

/// Two instances share the log. A write on X becomes visible on Y once Y's
/// apply loop has processed it; before that, Y reports not-found.
#[tokio::test]
async fn write_on_one_instance_is_visible_on_the_other() {
    let (dir, fabric_x) = common::temp_fabric();
    let fabric_y = common::fabric_at(dir.path());

    let x = common::started_store(&fabric_x).await;
    let y = common::started_store(&fabric_y).await;

    // Nothing written yet: Y must report a not-found handler failure.
    let err = y.exec("GetPerson", vec![json!(1)]).await.unwrap_err();
    assert!(err.is_handler_failure(), "got {err:?}");

    let id = x
        .exec("InsertPerson", vec![json!("A"), json!("B"), json!("a@b")])
        .await
        .unwrap();
    assert_eq!(id, json!(1));

    // Y's apply loop eventually processes the record.
    let deadline = Instant::now() + Duration::from_secs(5);
    let person = loop {
        match y.exec("GetPerson", vec![json!(1)]).await {
            Ok(person) => break person,
            Err(err) if Instant::now() < deadline => {
                assert!(err.is_handler_failure(), "got {err:?}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(err) => panic!("Y never observed the record: {err}"),
        }
    };

    assert_eq!(
        person,
        json!({
            "person_id": 1,
            "first_name": "A",
            "last_name": "B",
            "email": "a@b"
        })
    );
}

/// Writes interleaved across two instances converge: both replicas apply
/// the same log and end with the same rows.
#[tokio::test]
async fn interleaved_writes_converge_on_both_replicas() {
    let (dir, fabric_x) = common::temp_fabric();
    let fabric_y = common::fabric_at(dir.path());

    let x = common::started_store(&fabric_x).await;
    let y = common::started_store(&fabric_y).await;

    // Alternate writers, letting both replicas converge between writes so
    // every replica applies the log in the same order it was produced.
    let writes = [
        (&x, "A", "a@x"),
        (&y, "B", "b@x"),
        (&x, "C", "c@x"),
        (&y, "D", "d@x"),
    ];

    for (i, (writer, name, email)) in writes.into_iter().enumerate() {
        writer
            .exec(
                "InsertPerson",
                vec![json!(name), json!(name), json!(email)],
            )
            .await
            .unwrap();

        for store in [&x, &y] {
            let expected = json!(i + 1);
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let count = store.exec("CountPeople", vec![]).await.unwrap();
                if count == expected {
                    break;
                }
                assert!(
                    Instant::now() < deadline,
                    "replica stuck at {count} of {expected} rows"
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    let people_x = x.exec("SelectPeople", vec![]).await.unwrap();
    let people_y = y.exec("SelectPeople", vec![]).await.unwrap();
    assert_eq!(people_x, people_y);
}
