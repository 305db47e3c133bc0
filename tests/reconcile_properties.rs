use tally::entity::{
    Candidate, ContactStatus, EntityKind, EntityState, Observation, Position, TaskStatus,
};
use tally::reconcile::{merge, CanonicalState};
use tally::transcript::{Message, Role, Transcript};
use tally::extract::ExtractorRegistry;

fn task(id: &str, status: TaskStatus, message: usize) -> Candidate {
    Candidate::new(id, Observation::Task { status }, Position::new(message, 0))
}

#[test]
fn rerunning_merge_is_byte_identical() {
    let candidates = vec![
        task("1", TaskStatus::Available, 0),
        task("1", TaskStatus::Accepted, 1),
        Candidate::new("金币", Observation::ItemUsed { quantity: 1 }, Position::new(2, 0)),
        Candidate::new(
            "u1",
            Observation::Contact {
                status: ContactStatus::Requested,
            },
            Position::new(3, 0),
        ),
    ];

    let once = merge(CanonicalState::new(), &candidates);
    let twice = merge(once.state.clone(), &candidates);
    assert!(twice.delta.is_empty());
    assert_eq!(
        serde_json::to_string(&once.state).expect("json"),
        serde_json::to_string(&twice.state).expect("json")
    );
}

#[test]
fn status_never_regresses_whatever_the_order() {
    let orders = [
        vec![TaskStatus::Completed, TaskStatus::Available, TaskStatus::Accepted],
        vec![TaskStatus::Accepted, TaskStatus::Completed, TaskStatus::Available],
        vec![TaskStatus::Available, TaskStatus::Accepted, TaskStatus::Completed],
    ];
    for order in orders {
        let candidates: Vec<Candidate> = order
            .iter()
            .enumerate()
            .map(|(i, status)| task("9", *status, i))
            .collect();
        let merged = merge(CanonicalState::new(), &candidates);
        assert_eq!(
            merged.state.get(EntityKind::Task, "9").map(|e| e.state.clone()),
            Some(EntityState::Task {
                status: TaskStatus::Completed
            }),
            "order {order:?}"
        );
    }
}

#[test]
fn five_rescans_count_one_use() {
    let used = vec![Candidate::new(
        "药水",
        Observation::ItemUsed { quantity: 1 },
        Position::new(4, 0),
    )];
    let mut state = CanonicalState::new();
    for _ in 0..5 {
        state = merge(state, &used).state;
    }
    match &state.get(EntityKind::InventoryItem, "药水").expect("item").state {
        EntityState::InventoryItem { used_quantity, .. } => assert_eq!(*used_quantity, 1),
        other => panic!("unexpected state: {other:?}"),
    }
}

#[tokio::test]
async fn rerender_of_same_messages_changes_nothing() {
    let registry = ExtractorRegistry::with_builtin().expect("registry");
    let messages = vec![
        Message::new(0, Role::Other, "[购买物品|苹果|3]"),
        Message::new(1, Role::Me, "使用了苹果"),
        Message::new(2, Role::Other, "[积分|+10|签到] 获得了10积分"),
    ];
    let transcript = Transcript::new(messages.clone());

    let mut state = CanonicalState::new();
    let candidates: Vec<Candidate> = registry
        .run_all(&transcript)
        .await
        .into_iter()
        .flat_map(|r| r.candidates)
        .collect();
    state.apply(&candidates);
    let before = serde_json::to_string(&state).expect("json");

    // a host redraw hands the same messages back
    let rerendered = Transcript::new(messages);
    let candidates: Vec<Candidate> = registry
        .run_all(&rerendered)
        .await
        .into_iter()
        .flat_map(|r| r.candidates)
        .collect();
    assert!(state.apply(&candidates).is_empty());
    assert_eq!(before, serde_json::to_string(&state).expect("json"));

    match &state.get(EntityKind::InventoryItem, "苹果").expect("apple").state {
        EntityState::InventoryItem {
            count,
            used_quantity,
            acquired,
            ..
        } => {
            assert_eq!((*acquired, *used_quantity, *count), (3, 1, 2));
        }
        other => panic!("unexpected state: {other:?}"),
    }
    // tag and phrase in one message are one event
    assert_eq!(state.points_balance(), 10);
}
