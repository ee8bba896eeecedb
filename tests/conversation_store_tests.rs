use query_pilot::error::StoreError;
use query_pilot::persistence::ConversationStore;
use query_pilot::types::Message;
use std::sync::Arc;
use tempfile::TempDir;

fn numbered(n: usize) -> Vec<Message> {
    (0..n).map(|i| Message::user(format!("message {}", i))).collect()
}

#[test]
fn window_returns_last_messages_in_order() {
    let dir = TempDir::new().unwrap();
    let store = ConversationStore::open(dir.path()).unwrap();
    store.save("c1", &numbered(15)).unwrap();

    assert_eq!(store.get("c1").unwrap().len(), 15);
    let window = store.window("c1", 10).unwrap();
    assert_eq!(window.len(), 10);
    assert_eq!(window[0].content, "message 5");
    assert_eq!(window[9].content, "message 14");

    assert_eq!(store.window("c1", 50).unwrap().len(), 15);
    assert!(store.get("missing").unwrap().is_empty());
}

#[test]
fn save_overwrites_and_clear_removes() {
    let dir = TempDir::new().unwrap();
    let store = ConversationStore::open(dir.path()).unwrap();
    store.save("c1", &numbered(3)).unwrap();
    store.save("c1", &numbered(1)).unwrap();
    assert_eq!(store.get("c1").unwrap().len(), 1);

    store.clear("c1").unwrap();
    assert!(store.get("c1").unwrap().is_empty());
    store.clear("never-existed").unwrap();
}

#[test]
fn list_skips_empty_records_and_sorts_newest_first() {
    let dir = TempDir::new().unwrap();
    let store = ConversationStore::open(dir.path()).unwrap();
    store
        .save(
            "older",
            &[Message::system("rules"), Message::user("Which agencies pay the most overtime in total?")],
        )
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    store.save("newer", &[Message::user("headcount")]).unwrap();
    store.save("empty", &[]).unwrap();

    let list = store.list().unwrap();
    let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["newer", "older"]);
    assert_eq!(list[0].title, "headcount");
    assert_eq!(list[1].title, "Which agencies pay the most ov...");
    assert_eq!(list[1].message_count, 2);
}

#[test]
fn identifiers_are_sanitized() {
    let dir = TempDir::new().unwrap();
    let store = ConversationStore::open(dir.path()).unwrap();
    store.save("../../etc/passwd", &numbered(1)).unwrap();

    assert_eq!(store.get("etcpasswd").unwrap().len(), 1);
    assert!(!dir.path().join("../../etc/passwd.json").exists());

    let err = store.save("../..", &numbered(1)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidKey(_))
    ));
}

#[test]
fn concurrent_appends_to_one_conversation_are_not_lost() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ConversationStore::open(dir.path()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store
                    .append("shared", &[Message::user(format!("from {}", i))])
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.get("shared").unwrap().len(), 8);
}
