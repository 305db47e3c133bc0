use tally::output::{format_human, infer_command_name, HumanOutput};

#[test]
fn format_human_aligns_rows_and_groups_sections() {
    let mut human = HumanOutput::new("tally scan: 3 messages, 2 entities");
    human.push_row("task", "1");
    human.push_row("points balance", "30");
    human.push_line("Tasks", "42  [completed]  Fetch Water  reward 10");
    human.push_line("Inventory", "金币  [held]  x1  used 2");
    human.push_line("Tasks", "43  [available]");
    human.push_warning("extractor 'points' failed; its results were skipped");
    human.push_next_step("tally watch chat.jsonl");

    let rendered = format_human(&human);
    let expected = "\
tally scan: 3 messages, 2 entities

  task            1
  points balance  30

Tasks (2):
  42  [completed]  Fetch Water  reward 10
  43  [available]

Inventory (1):
  金币  [held]  x1  used 2

warning: extractor 'points' failed; its results were skipped
next: tally watch chat.jsonl";
    assert_eq!(rendered, expected);
}

#[test]
fn format_human_omits_empty_sections() {
    let human = HumanOutput::new("tally config");
    assert_eq!(format_human(&human), "tally config");
}

#[test]
fn empty_row_values_render_bare() {
    let mut human = HumanOutput::new("tally config");
    human.push_row("detector.allow", "");
    assert!(format_human(&human).ends_with("\n  detector.allow"));
}

#[test]
fn command_name_ignores_global_flags() {
    assert_eq!(infer_command_name(["--quiet", "watch", "chat.jsonl"]), "watch");
}
