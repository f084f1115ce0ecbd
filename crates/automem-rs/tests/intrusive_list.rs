use automem_rs::util::TokenList;

#[test]
fn push_back_services_fifo() {
    let mut list: TokenList<u32> = TokenList::new();
    list.push_back(1);
    list.push_back(2);
    list.push_back(3);
    assert_eq!(list.len(), 3);
    assert_eq!(list.pop_front(), Some(1));
    assert_eq!(list.pop_front(), Some(2));
    assert_eq!(list.pop_front(), Some(3));
    assert_eq!(list.pop_front(), None);
    assert!(list.is_empty());
}

#[test]
fn push_front_services_lifo() {
    let mut list: TokenList<u32> = TokenList::new();
    list.push_front(1);
    list.push_front(2);
    list.push_front(3);
    assert_eq!(list.pop_front(), Some(3));
    assert_eq!(list.pop_front(), Some(2));
    assert_eq!(list.pop_front(), Some(1));
}

#[test]
fn unlink_detaches_without_freeing() {
    let mut list: TokenList<&str> = TokenList::new();
    let a = list.push_back("a");
    let b = list.push_back("b");
    list.push_back("c");

    assert!(list.attached(b));
    assert!(list.unlink(b));
    assert!(!list.attached(b));
    assert!(!list.unlink(b));
    assert_eq!(list.len(), 2);
    assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec!["a", "c"]);

    // A detached node can be relinked at either end.
    list.link_front(b);
    assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec!["b", "a", "c"]);

    assert_eq!(list.take(a), "a");
    assert_eq!(list.len(), 2);
}

#[test]
fn find_locates_by_predicate() {
    let mut list: TokenList<u64> = TokenList::new();
    list.push_back(10);
    let t20 = list.push_back(20);
    list.push_back(30);

    let found = list.find(|v| *v == 20).expect("present");
    assert_eq!(found, t20);
    assert_eq!(list.take(found), 20);
    assert!(list.find(|v| *v == 20).is_none());
}

#[test]
fn slots_are_recycled() {
    let mut list: TokenList<u32> = TokenList::new();
    let a = list.push_back(1);
    list.take(a);
    let b = list.push_back(2);
    assert_eq!(list.len(), 1);
    assert_eq!(list.take(b), 2);
}

#[test]
#[should_panic(expected = "double insertion")]
fn double_insertion_is_fatal() {
    let mut list: TokenList<u32> = TokenList::new();
    let token = list.push_back(7);
    list.link_back(token);
}

#[test]
#[should_panic(expected = "stale token")]
fn stale_tokens_are_detected() {
    let mut list: TokenList<u32> = TokenList::new();
    let token = list.push_back(7);
    list.take(token);
    // The slot may have been recycled; the generation check rejects the
    // stale handle.
    list.push_back(8);
    list.attached(token);
}
