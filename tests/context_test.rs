mod helpers;

use helpers::{record, scope, secs, t0};
use recollect::deletion;
use recollect::history::context::assemble_context;
use recollect::history::{Attachment, ConversationScope};
use recollect::settings::resolver::resolve_layers;
use recollect::settings::{HardcodedDefaults, LayerSet, ResolvedSettings};

fn defaults() -> ResolvedSettings {
    resolve_layers(&HardcodedDefaults::default(), &LayerSet::default())
}

fn contents(conn: &rusqlite::Connection, settings: &ResolvedSettings, scope: &ConversationScope, now: chrono::DateTime<chrono::Utc>) -> Vec<String> {
    assemble_context(conn, settings, scope, now)
        .turns
        .into_iter()
        .map(|t| t.content)
        .collect()
}

#[test]
fn clear_t1_turn_t2_clear_t3() {
    let mut conn = helpers::test_db();
    let s = scope("p1");
    let settings = defaults();

    record(&mut conn, &s, "before everything", t0());
    let t1 = t0() + secs(10);
    deletion::clear(&mut conn, &s, t1).unwrap();
    // Same instant as the tombstone: hidden.
    record(&mut conn, &s, "at the boundary", t1);

    let t2 = t0() + secs(20);
    record(&mut conn, &s, "between clears", t2);
    assert_eq!(contents(&conn, &settings, &s, t2 + secs(1)), vec!["between clears"]);

    let t3 = t0() + secs(30);
    deletion::clear(&mut conn, &s, t3).unwrap();
    assert!(contents(&conn, &settings, &s, t3 + secs(1)).is_empty());

    record(&mut conn, &s, "after", t3 + secs(5));
    assert_eq!(contents(&conn, &settings, &s, t3 + secs(6)), vec!["after"]);
}

#[test]
fn clear_is_scoped_to_persona() {
    let mut conn = helpers::test_db();
    let (a, b) = (scope("p1"), scope("p2"));
    record(&mut conn, &a, "from p1", t0());
    record(&mut conn, &b, "from p2", t0());

    deletion::clear(&mut conn, &a, t0() + secs(1)).unwrap();
    let settings = defaults();
    assert!(contents(&conn, &settings, &a, t0() + secs(2)).is_empty());
    assert_eq!(contents(&conn, &settings, &b, t0() + secs(2)), vec!["from p2"]);
}

#[test]
fn window_respects_max_messages_and_age() {
    let mut conn = helpers::test_db();
    let s = scope("p1");
    for i in 0..6 {
        record(&mut conn, &s, &format!("turn {i}"), t0() + secs(i * 60));
    }
    let now = t0() + secs(5 * 60 + 1);

    let mut settings = defaults();
    settings.max_messages = 3;
    assert_eq!(contents(&conn, &settings, &s, now), vec!["turn 3", "turn 4", "turn 5"]);

    settings.max_messages = 50;
    settings.max_age = Some(150);
    assert_eq!(contents(&conn, &settings, &s, now), vec!["turn 3", "turn 4", "turn 5"]);

    settings.max_age = Some(0);
    assert_eq!(contents(&conn, &settings, &s, now).len(), 6, "zero age means unbounded");
}

#[test]
fn images_are_newest_first_and_capped() {
    let mut conn = helpers::test_db();
    let s = scope("p1");
    for i in 0..4 {
        let mut event = helpers::user_turn(&s, &format!("pic {i}"));
        event.attachments = vec![
            Attachment { url: format!("img-{i}.png"), content_type: "image/png".into(), name: None },
            Attachment { url: format!("doc-{i}.pdf"), content_type: "application/pdf".into(), name: None },
        ];
        recollect::history::store::append_turn(&mut conn, &event, t0() + secs(i)).unwrap();
    }

    let mut settings = defaults();
    settings.max_images = 2;
    let ctx = assemble_context(&conn, &settings, &s, t0() + secs(10));
    let urls: Vec<&str> = ctx.images.iter().map(|a| a.url.as_str()).collect();
    assert_eq!(urls, vec!["img-3.png", "img-2.png"]);
    assert_eq!(ctx.turns.len(), 4);
}

#[test]
fn undo_removes_latest_turns_from_context() {
    let mut conn = helpers::test_db();
    let s = scope("p1");
    record(&mut conn, &s, "keep", t0());
    record(&mut conn, &s, "oops", t0() + secs(1));
    record(&mut conn, &s, "oops again", t0() + secs(2));

    let result = deletion::undo(&mut conn, &s, 2, t0() + secs(3)).unwrap();
    assert_eq!(result.turns_removed, 2);
    assert_eq!(contents(&conn, &defaults(), &s, t0() + secs(4)), vec!["keep"]);
}

#[test]
fn edit_updates_turn_and_unclaimed_pending_text() {
    let mut conn = helpers::test_db();
    let s = scope("p1");
    let turn = record(&mut conn, &s, "teh cat", t0());

    assert!(recollect::history::store::edit_turn(&mut conn, &turn.id, "the cat", t0() + secs(1)).unwrap());
    let pending = recollect::writeback::queue::pending_for_turn(&conn, &turn.id).unwrap().unwrap();
    assert_eq!(pending.text, "the cat");

    let ctx = assemble_context(&conn, &defaults(), &s, t0() + secs(2));
    assert_eq!(ctx.turns[0].content, "the cat");
    assert!(ctx.turns[0].edited_at.is_some());
}
