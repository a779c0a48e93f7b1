use crate::{
    expand::{Arg, JobSpec},
    job::{JobDescriptor, Kwargs},
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn descriptor(args: Vec<Value>, kwargs: &[(&str, Value)]) -> JobDescriptor {
    let kwargs = kwargs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect::<Kwargs>();

    JobDescriptor::new("echo", args, kwargs)
}

#[test]
fn positional_before_keyword_last_varies_fastest() {
    let spec = JobSpec::new("echo")
        .arg(Arg::permute([1, 2]))
        .kwarg("b", Arg::permute(["x", "y"]));

    assert_eq!(
        spec.expand(),
        vec![
            descriptor(vec![json!(1)], &[("b", json!("x"))]),
            descriptor(vec![json!(1)], &[("b", json!("y"))]),
            descriptor(vec![json!(2)], &[("b", json!("x"))]),
            descriptor(vec![json!(2)], &[("b", json!("y"))]),
        ]
    );
}

#[test]
fn fixed_arguments_keep_their_position() {
    let spec = JobSpec::new("echo")
        .arg(Arg::fixed("a"))
        .arg(Arg::permute([1, 2, 3]))
        .arg(Arg::fixed(true))
        .kwarg("k", Arg::fixed(json!({"nested": [1, 2]})));

    let jobs = spec.expand();

    assert_eq!(jobs.len(), 3);
    for (job, value) in jobs.iter().zip(1..) {
        assert_eq!(job.args(), &[json!("a"), json!(value), json!(true)]);
        assert_eq!(job.kwargs()["k"], json!({"nested": [1, 2]}));
    }
}

#[test]
fn without_sweeps_exactly_one_job() {
    let spec = JobSpec::new("echo").arg(Arg::fixed(1)).kwarg("k", Arg::fixed("v"));

    assert_eq!(
        spec.expand(),
        vec![descriptor(vec![json!(1)], &[("k", json!("v"))])]
    );
    assert_eq!(JobSpec::new("echo").expand().len(), 1);
}

#[test]
fn empty_candidate_list_yields_nothing() {
    let spec = JobSpec::new("echo")
        .arg(Arg::permute([1, 2]))
        .kwarg("k", Arg::permute(Vec::<Value>::new()));

    assert!(spec.expand().is_empty());
}

#[test]
fn sweep_size_is_product_of_candidates() {
    let spec = JobSpec::new("echo")
        .arg(Arg::permute(0..4))
        .arg(Arg::permute(0..5))
        .kwarg("k", Arg::permute(0..3));

    assert_eq!(spec.expand().len(), 60);
}

#[test]
fn permute_marker_from_yaml() {
    let spec: JobSpec = serde_yaml::from_str(
        r#"
unit: echo
args:
  - {permute: [1, 2]}
  - {a: 1}
kwargs:
  name: {permute: [x]}
  fixed: [1, 2]
"#,
    )
    .unwrap();

    assert_eq!(spec.work_unit, "echo");
    assert_eq!(spec.args, vec![Arg::permute([1, 2]), Arg::fixed(json!({"a": 1}))]);
    assert_eq!(spec.kwargs["name"], Arg::permute(["x"]));
    assert_eq!(spec.kwargs["fixed"], Arg::fixed(json!([1, 2])));
    assert!(spec.kwargs["name"].is_swept());
    assert!(!spec.kwargs["fixed"].is_swept());
    assert_eq!(spec.expand().len(), 2);
}

#[test]
fn only_a_lone_permute_entry_sweeps() {
    let spec: JobSpec = serde_yaml::from_str(
        r#"
unit: echo
args:
  - [[1, 2]]
  - {permute: [1], other: 2}
  - {permute: 3}
"#,
    )
    .unwrap();

    assert!(spec.args.iter().all(|arg| !arg.is_swept()));
    assert_eq!(spec.args[0], Arg::fixed(json!([[1, 2]])));
    assert_eq!(spec.expand().len(), 1);
}

#[test]
fn unknown_spec_fields_are_rejected() {
    let result = serde_yaml::from_str::<JobSpec>("unit: echo\nargz: [1]\n");

    assert!(result.is_err());
}
