use serde_json::Value;
use std::process::Command;

fn run_json(args: &[&str]) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_thermonode-sim"))
        .args(args)
        .args(["--format", "json"])
        .output()
        .expect("simulator should start");
    assert!(output.status.success(), "simulator failed: {:?}", output);

    let stdout = String::from_utf8(output.stdout).expect("stdout should be UTF-8");
    serde_json::from_str(&stdout).unwrap_or_else(|err| panic!("stdout is not one JSON document ({err}):\n{stdout}"))
}

#[test]
fn test_json_report_is_the_only_stdout_output() {
    let report = run_json(&["-n", "3", "-c", "2", "-d", "3"]);

    assert_eq!(report["sensors_found"], 3);
    assert_eq!(report["cycles"].as_array().unwrap().len(), 2);
    assert_eq!(report["advertisements"].as_array().unwrap().len(), 2);
    assert!(report["cycles"][1]["readings"]
        .as_array()
        .unwrap()
        .iter()
        .all(|reading| reading["valid"] == true));
}

#[test]
fn test_rail_switches_exclude_the_initial_level() {
    // One discovery and one measurement, each switching on and off once.
    let empty = run_json(&["-n", "0", "-c", "1"]);
    assert_eq!(empty["rail_switches"], 4);

    let populated = run_json(&["-n", "2", "-c", "2"]);
    assert_eq!(populated["rail_switches"], 6);
}
