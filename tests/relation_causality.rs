//! Relation-only deltas: a new edge marks only its child endpoint, so
//! siblings under a shared parent are never rescheduled.

mod common;

use common::{bucket_item, setup};
use reflexgraph::transport::Entity;

#[test]
fn adding_a_sibling_does_not_reschedule_the_old_one() {
    let h = setup(&[bucket_item()]);
    h.seed(&Entity::new("Bucket").with_value("B-1"));
    let bucket = h.find_id("Bucket", "B-1");

    h.feed(
        &Entity::new("Bucket")
            .with_id(bucket)
            .with_child(Entity::new("Item").with_value("I-1")),
    );
    assert_eq!(h.job_count(), 1);

    h.feed(
        &Entity::new("Bucket")
            .with_id(bucket)
            .with_child(Entity::new("Item").with_value("I-2")),
    );
    assert_eq!(h.job_count(), 2, "first item must not be rescheduled");
}

#[test]
fn multiple_new_children_in_one_delta_schedule_once_each() {
    let h = setup(&[bucket_item()]);
    h.seed(&Entity::new("Bucket").with_value("B-2"));
    let bucket = h.find_id("Bucket", "B-2");

    h.feed(
        &Entity::new("Bucket")
            .with_id(bucket)
            .with_child(Entity::new("Item").with_value("I-1")),
    );
    assert_eq!(h.job_count(), 1);

    h.feed(
        &Entity::new("Bucket")
            .with_id(bucket)
            .with_child(Entity::new("Item").with_value("I-2"))
            .with_child(Entity::new("Item").with_value("I-3")),
    );
    assert_eq!(h.job_count(), 3, "existing item must stay untouched");
}

#[test]
fn every_job_input_contains_a_changed_entity() {
    let h = setup(&[bucket_item()]);
    h.seed(&Entity::new("Bucket").with_value("B-3"));
    let bucket = h.find_id("Bucket", "B-3");
    let tagged = h.feed(
        &Entity::new("Bucket")
            .with_id(bucket)
            .with_child(Entity::new("Item").with_value("I-1")),
    );
    let item = h.find_id("Item", "I-1");
    // the batch marked exactly the child endpoint
    assert_eq!(tagged.children[0].target.id, item);

    let jobs = h.store.query(&reflexgraph::store::Query::read("Job")).unwrap();
    for job_entity in &jobs.entities {
        let input = reflexgraph::job::decode_input(job_entity).unwrap();
        assert!(input.contains("Item", item), "strict causality violated");
    }
}
