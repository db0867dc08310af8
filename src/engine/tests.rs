use super::*;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// 2024-01-01T00:00:00Z
const DAY: Ms = 1_704_067_200_000;

fn at(hour: Ms, minute: Ms) -> Ms {
    DAY + hour * H + minute * M
}

fn window(start: Ms, end: Ms) -> Window {
    Window::new(start, end)
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("spacebook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

async fn engine_with_space(wal: &str) -> (Engine, SpaceId) {
    let engine = Engine::new(test_wal_path(wal)).unwrap();
    let sid = engine.register_space("Room A".into(), 10).await.unwrap();
    (engine, sid)
}

fn assert_no_overlaps(reservations: &[ReservationInfo]) {
    for (i, a) in reservations.iter().enumerate() {
        for b in &reservations[i + 1..] {
            if a.space_id != b.space_id {
                continue;
            }
            assert!(
                !(a.start <= b.end && a.end >= b.start),
                "reservations {} and {} overlap",
                a.id,
                b.id
            );
        }
    }
}

// ── Duration rule ────────────────────────────────────────────

#[test]
fn validate_duration_bounds() {
    assert!(validate_duration(&window(0, H)));
    assert!(validate_duration(&window(0, 8 * H)));
    assert!(validate_duration(&window(0, 3 * H + 17 * M)));
    assert!(!validate_duration(&window(0, 59 * M)));
    assert!(!validate_duration(&window(0, 8 * H + M)));
    assert!(!validate_duration(&window(0, 8 * H + 1)));
    assert!(!validate_duration(&window(0, H - 1)));
    assert!(!validate_duration(&window(5 * H, 5 * H)));
    assert!(!validate_duration(&window(5 * H, 4 * H)));
}

#[tokio::test]
async fn extreme_windows_are_invalid_durations() {
    assert_eq!(window(-i64::MAX, i64::MAX).duration_ms(), i64::MAX);
    assert_eq!(window(i64::MAX, i64::MIN).duration_ms(), i64::MIN);

    let (engine, sid) = engine_with_space("extreme_windows.wal").await;
    for w in [window(-i64::MAX, i64::MAX), window(i64::MAX, i64::MIN)] {
        let err = engine.create_reservation(sid, w).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDuration { .. }), "{err}");
    }
    assert!(engine.list_reservations().await.is_empty());
}

#[tokio::test]
async fn exactly_one_hour_succeeds() {
    let (engine, sid) = engine_with_space("one_hour.wal").await;
    engine.create_reservation(sid, window(at(10, 0), at(11, 0))).await.unwrap();
}

#[tokio::test]
async fn exactly_eight_hours_succeeds() {
    let (engine, sid) = engine_with_space("eight_hours.wal").await;
    engine.create_reservation(sid, window(at(9, 0), at(17, 0))).await.unwrap();
}

#[tokio::test]
async fn fifty_nine_minutes_rejected() {
    let (engine, sid) = engine_with_space("fifty_nine.wal").await;
    let err = engine
        .create_reservation(sid, window(at(10, 0), at(10, 59)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDuration { duration_ms } if duration_ms == 59 * M));
    assert_eq!(err.rejection(), Some(RejectReason::Duration));
}

#[tokio::test]
async fn eight_hours_one_minute_rejected() {
    let (engine, sid) = engine_with_space("eight_one.wal").await;
    let err = engine
        .create_reservation(sid, window(at(9, 0), at(17, 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDuration { .. }));
}

#[tokio::test]
async fn zero_and_negative_durations_rejected() {
    let (engine, sid) = engine_with_space("zero_negative.wal").await;
    let zero = engine.create_reservation(sid, window(at(10, 0), at(10, 0))).await;
    assert!(matches!(zero, Err(EngineError::InvalidDuration { duration_ms: 0 })));

    let negative = engine.create_reservation(sid, window(at(11, 0), at(10, 0))).await;
    assert!(matches!(negative, Err(EngineError::InvalidDuration { duration_ms }) if duration_ms == -H));

    assert!(engine.list_reservations().await.is_empty());
}

#[tokio::test]
async fn far_future_dates_accepted() {
    let (engine, sid) = engine_with_space("far_future.wal").await;
    // 2100-01-01T00:00:00Z
    let start = 4_102_444_800_000;
    engine.create_reservation(sid, window(start, start + 2 * H)).await.unwrap();
}

#[tokio::test]
async fn duration_checked_before_overlap() {
    let (engine, sid) = engine_with_space("duration_first.wal").await;
    engine.create_reservation(sid, window(at(10, 0), at(11, 0))).await.unwrap();

    // Both too short and overlapping: duration wins.
    let err = engine
        .create_reservation(sid, window(at(10, 15), at(10, 45)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDuration { .. }));
}

// ── Overlap rule ─────────────────────────────────────────────

#[tokio::test]
async fn partial_overlap_rejected() {
    let (engine, sid) = engine_with_space("partial_overlap.wal").await;
    let first = engine.create_reservation(sid, window(at(10, 0), at(11, 0))).await.unwrap();

    let err = engine
        .create_reservation(sid, window(at(10, 30), at(11, 30)))
        .await
        .unwrap_err();
    match err {
        EngineError::OverlapConflict { space_id, conflicting } => {
            assert_eq!(space_id, sid);
            assert_eq!(conflicting, vec![first]);
        }
        other => panic!("expected OverlapConflict, got {other:?}"),
    }
    assert_eq!(engine.list_reservations_by_space(sid).await.len(), 1);
}

#[tokio::test]
async fn touching_boundary_rejected() {
    let (engine, sid) = engine_with_space("touching.wal").await;
    engine.create_reservation(sid, window(at(10, 0), at(11, 0))).await.unwrap();

    let after = engine.create_reservation(sid, window(at(11, 0), at(12, 0))).await;
    assert!(matches!(after, Err(EngineError::OverlapConflict { .. })));

    let before = engine.create_reservation(sid, window(at(9, 0), at(10, 0))).await;
    assert!(matches!(before, Err(EngineError::OverlapConflict { .. })));
}

#[tokio::test]
async fn one_millisecond_gap_allowed() {
    let (engine, sid) = engine_with_space("ms_gap.wal").await;
    engine.create_reservation(sid, window(at(10, 0), at(11, 0))).await.unwrap();
    engine
        .create_reservation(sid, window(at(11, 0) + 1, at(12, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn containment_rejected_both_ways() {
    let (engine, sid) = engine_with_space("containment.wal").await;
    engine.create_reservation(sid, window(at(10, 0), at(14, 0))).await.unwrap();

    let inner = engine.create_reservation(sid, window(at(11, 0), at(12, 0))).await;
    assert!(matches!(inner, Err(EngineError::OverlapConflict { .. })));

    let outer = engine.create_reservation(sid, window(at(9, 0), at(15, 0))).await;
    assert!(matches!(outer, Err(EngineError::OverlapConflict { .. })));
}

#[tokio::test]
async fn conflict_lists_every_overlapping_reservation() {
    let (engine, sid) = engine_with_space("conflict_list.wal").await;
    let a = engine.create_reservation(sid, window(at(8, 0), at(9, 0))).await.unwrap();
    let b = engine.create_reservation(sid, window(at(10, 0), at(11, 0))).await.unwrap();
    engine.create_reservation(sid, window(at(14, 0), at(15, 0))).await.unwrap();

    let err = engine
        .create_reservation(sid, window(at(9, 0), at(13, 0)))
        .await
        .unwrap_err();
    match err {
        EngineError::OverlapConflict { mut conflicting, .. } => {
            conflicting.sort();
            assert_eq!(conflicting, vec![a, b]);
        }
        other => panic!("expected OverlapConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn different_spaces_hold_identical_intervals() {
    let (engine, a) = engine_with_space("different_spaces.wal").await;
    let b = engine.register_space("Room B".into(), 4).await.unwrap();

    engine.create_reservation(a, window(at(10, 0), at(11, 0))).await.unwrap();
    engine.create_reservation(b, window(at(10, 0), at(11, 0))).await.unwrap();
    assert_eq!(engine.list_reservations().await.len(), 2);
}

#[tokio::test]
async fn create_on_unknown_space_fails() {
    let engine = Engine::new(test_wal_path("unknown_space.wal")).unwrap();
    let err = engine
        .create_reservation(42, window(at(10, 0), at(11, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SpaceNotFound(42)));
    assert!(err.is_not_found());
    assert_eq!(err.rejection(), None);
}

// ── Space registry ───────────────────────────────────────────

#[tokio::test]
async fn duplicate_name_rejected() {
    let (engine, _) = engine_with_space("duplicate_name.wal").await;
    let err = engine.register_space("Room A".into(), 3).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(ref n) if n == "Room A"));

    let spaces = engine.list_spaces().await;
    assert_eq!(spaces.len(), 1);
    assert_eq!(spaces[0].capacity, 10);
}

#[tokio::test]
async fn names_are_case_sensitive() {
    let (engine, _) = engine_with_space("case_sensitive.wal").await;
    engine.register_space("room a".into(), 3).await.unwrap();
    assert_eq!(engine.list_spaces().await.len(), 2);
}

#[tokio::test]
async fn register_validates_arguments() {
    let engine = Engine::new(test_wal_path("register_invalid.wal")).unwrap();
    assert!(matches!(
        engine.register_space("".into(), 3).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.register_space("   ".into(), 3).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.register_space("Room".into(), 0).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(engine.list_spaces().await.is_empty());
}

#[tokio::test]
async fn get_and_list_spaces() {
    let engine = Engine::new(test_wal_path("get_list_spaces.wal")).unwrap();
    let a = engine.register_space("Room A".into(), 10).await.unwrap();
    let b = engine.register_space("Booth".into(), 2).await.unwrap();
    assert!(b > a);

    let info = engine.get_space(b).await.unwrap();
    assert_eq!(info, SpaceInfo { id: b, name: "Booth".into(), capacity: 2 });

    let ids: Vec<_> = engine.list_spaces().await.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a, b]);

    assert!(matches!(engine.get_space(99).await, Err(EngineError::SpaceNotFound(99))));
}

#[tokio::test]
async fn update_space_partial() {
    let (engine, sid) = engine_with_space("update_partial.wal").await;

    engine.update_space(sid, None, Some(25)).await.unwrap();
    let info = engine.get_space(sid).await.unwrap();
    assert_eq!(info.name, "Room A");
    assert_eq!(info.capacity, 25);

    engine.update_space(sid, Some("Atrium".into()), None).await.unwrap();
    let info = engine.get_space(sid).await.unwrap();
    assert_eq!(info.name, "Atrium");
    assert_eq!(info.capacity, 25);
}

#[tokio::test]
async fn rename_frees_old_name() {
    let (engine, sid) = engine_with_space("rename_frees.wal").await;
    engine.update_space(sid, Some("Atrium".into()), None).await.unwrap();

    engine.register_space("Room A".into(), 1).await.unwrap();
    let dup = engine.register_space("Atrium".into(), 1).await;
    assert!(matches!(dup, Err(EngineError::DuplicateName(_))));
}

#[tokio::test]
async fn rename_onto_other_space_rejected() {
    let (engine, a) = engine_with_space("rename_dup.wal").await;
    let b = engine.register_space("Room B".into(), 4).await.unwrap();

    let err = engine.update_space(b, Some("Room A".into()), Some(8)).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(_)));

    // Nothing changed on either space.
    assert_eq!(engine.get_space(b).await.unwrap().name, "Room B");
    assert_eq!(engine.get_space(b).await.unwrap().capacity, 4);
    assert_eq!(engine.get_space(a).await.unwrap().name, "Room A");
}

#[tokio::test]
async fn rename_to_own_name_succeeds() {
    let (engine, sid) = engine_with_space("rename_self.wal").await;
    engine.update_space(sid, Some("Room A".into()), Some(12)).await.unwrap();
    assert_eq!(engine.get_space(sid).await.unwrap().capacity, 12);
}

#[tokio::test]
async fn update_unknown_space_not_found() {
    let engine = Engine::new(test_wal_path("update_unknown_space.wal")).unwrap();
    let err = engine.update_space(7, None, Some(3)).await.unwrap_err();
    assert!(matches!(err, EngineError::SpaceNotFound(7)));
}

#[tokio::test]
async fn delete_space_cascades_to_reservations() {
    let (engine, sid) = engine_with_space("delete_cascade.wal").await;
    let other = engine.register_space("Room B".into(), 2).await.unwrap();
    let r1 = engine.create_reservation(sid, window(at(9, 0), at(10, 0))).await.unwrap();
    let r2 = engine.create_reservation(sid, window(at(12, 0), at(13, 0))).await.unwrap();
    let kept = engine.create_reservation(other, window(at(9, 0), at(10, 0))).await.unwrap();

    engine.delete_space(sid).await.unwrap();

    assert!(matches!(engine.get_space(sid).await, Err(EngineError::SpaceNotFound(_))));
    assert!(matches!(engine.get_reservation(r1).await, Err(EngineError::ReservationNotFound(_))));
    assert!(matches!(engine.cancel_reservation(r2).await, Err(EngineError::ReservationNotFound(_))));
    assert!(engine.list_reservations_by_space(sid).await.is_empty());

    let remaining: Vec<_> = engine.list_reservations().await.iter().map(|r| r.id).collect();
    assert_eq!(remaining, vec![kept]);

    // The name is free again and the old id is gone for good.
    let again = engine.register_space("Room A".into(), 1).await.unwrap();
    assert_ne!(again, sid);
    let err = engine
        .create_reservation(sid, window(at(9, 0), at(10, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SpaceNotFound(_)));
}

#[tokio::test]
async fn delete_missing_reports_not_found() {
    let engine = Engine::new(test_wal_path("delete_missing.wal")).unwrap();
    assert!(matches!(engine.delete_space(5).await, Err(EngineError::SpaceNotFound(5))));
    assert!(matches!(
        engine.cancel_reservation(5).await,
        Err(EngineError::ReservationNotFound(5))
    ));

    let sid = engine.register_space("Room A".into(), 1).await.unwrap();
    engine.delete_space(sid).await.unwrap();
    assert!(engine.delete_space(sid).await.unwrap_err().is_not_found());
}

// ── Reservation lifecycle ────────────────────────────────────

#[tokio::test]
async fn reservation_lifecycle() {
    let (engine, sid) = engine_with_space("lifecycle.wal").await;
    let id = engine.create_reservation(sid, window(at(10, 0), at(12, 0))).await.unwrap();

    let info = engine.get_reservation(id).await.unwrap();
    assert_eq!(
        info,
        ReservationInfo { id, space_id: sid, start: at(10, 0), end: at(12, 0) }
    );

    engine.cancel_reservation(id).await.unwrap();
    assert!(matches!(engine.get_reservation(id).await, Err(EngineError::ReservationNotFound(_))));
    assert!(matches!(engine.cancel_reservation(id).await, Err(EngineError::ReservationNotFound(_))));

    // The slot is free again.
    engine.create_reservation(sid, window(at(10, 0), at(12, 0))).await.unwrap();
}

#[tokio::test]
async fn update_within_own_slot_succeeds() {
    let (engine, sid) = engine_with_space("update_own_slot.wal").await;
    let id = engine.create_reservation(sid, window(at(10, 0), at(12, 0))).await.unwrap();

    // Overlaps only its own current interval.
    engine.update_reservation_time(id, window(at(11, 0), at(13, 0))).await.unwrap();
    let info = engine.get_reservation(id).await.unwrap();
    assert_eq!((info.start, info.end), (at(11, 0), at(13, 0)));
}

#[tokio::test]
async fn update_into_other_reservation_rejected() {
    let (engine, sid) = engine_with_space("update_overlap.wal").await;
    let a = engine.create_reservation(sid, window(at(8, 0), at(9, 0))).await.unwrap();
    let b = engine.create_reservation(sid, window(at(12, 0), at(13, 0))).await.unwrap();

    let err = engine
        .update_reservation_time(b, window(at(8, 30), at(10, 0)))
        .await
        .unwrap_err();
    match err {
        EngineError::OverlapConflict { conflicting, .. } => assert_eq!(conflicting, vec![a]),
        other => panic!("expected OverlapConflict, got {other:?}"),
    }

    let info = engine.get_reservation(b).await.unwrap();
    assert_eq!((info.start, info.end), (at(12, 0), at(13, 0)));
}

#[tokio::test]
async fn update_with_bad_duration_rejected() {
    let (engine, sid) = engine_with_space("update_duration.wal").await;
    let id = engine.create_reservation(sid, window(at(10, 0), at(11, 0))).await.unwrap();

    let err = engine
        .update_reservation_time(id, window(at(10, 0), at(19, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDuration { .. }));

    let info = engine.get_reservation(id).await.unwrap();
    assert_eq!((info.start, info.end), (at(10, 0), at(11, 0)));
}

#[tokio::test]
async fn update_unknown_reservation_not_found() {
    let (engine, _) = engine_with_space("update_unknown.wal").await;
    let err = engine
        .update_reservation_time(77, window(at(10, 0), at(11, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ReservationNotFound(77)));
}

#[tokio::test]
async fn list_orders() {
    let (engine, sid) = engine_with_space("list_orders.wal").await;
    let late = engine.create_reservation(sid, window(at(15, 0), at(16, 0))).await.unwrap();
    let early = engine.create_reservation(sid, window(at(8, 0), at(9, 0))).await.unwrap();
    let mid = engine.create_reservation(sid, window(at(11, 0), at(12, 0))).await.unwrap();

    let by_start: Vec<_> = engine
        .list_reservations_by_space(sid)
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(by_start, vec![early, mid, late]);

    let by_id: Vec<_> = engine.list_reservations().await.iter().map(|r| r.id).collect();
    assert_eq!(by_id, vec![late, early, mid]);

    assert!(engine.list_reservations_by_space(999).await.is_empty());
}

#[tokio::test]
async fn find_overlaps_report() {
    let (engine, sid) = engine_with_space("find_overlaps.wal").await;
    let a = engine.create_reservation(sid, window(at(9, 0), at(10, 0))).await.unwrap();
    let b = engine.create_reservation(sid, window(at(11, 0), at(12, 0))).await.unwrap();

    let hits: Vec<_> = engine
        .find_overlaps(sid, window(at(10, 0), at(11, 0)), None)
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(hits, vec![a, b]);

    let hits: Vec<_> = engine
        .find_overlaps(sid, window(at(10, 0), at(11, 0)), Some(a))
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(hits, vec![b]);

    assert!(engine.find_overlaps(sid, window(at(13, 0), at(14, 0)), None).await.is_empty());
    assert!(engine.find_overlaps(404, window(at(9, 0), at(10, 0)), None).await.is_empty());
}

// ── Concurrency ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_same_slot_single_winner() {
    let path = test_wal_path("concurrent_same_slot.wal");
    let engine = Arc::new(Engine::new(path).unwrap());
    let sid = engine.register_space("Room A".into(), 1).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            // Every window covers 10:30, so at most one can win.
            let start = at(10, 0) + (i % 4) * 10 * M;
            eng.create_reservation(sid, window(start, start + H)).await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::OverlapConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.list_reservations_by_space(sid).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_staggered_creates_never_overlap() {
    let path = test_wal_path("concurrent_staggered.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());
    let a = engine.register_space("Room A".into(), 1).await.unwrap();
    let b = engine.register_space("Room B".into(), 1).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..64 {
        let eng = engine.clone();
        let sid = if i % 2 == 0 { a } else { b };
        handles.push(tokio::spawn(async move {
            let start = at(0, 0) + (i * 37 % 48) * 15 * M;
            let len = H + (i % 3) * 30 * M;
            eng.create_reservation(sid, window(start, start + len)).await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    let all = engine.list_reservations().await;
    assert!(!all.is_empty());
    assert_no_overlaps(&all);

    // The durable log agrees with memory.
    let replayed = Engine::new(path).unwrap();
    assert_eq!(replayed.list_reservations().await, all);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_single_winner() {
    let path = test_wal_path("concurrent_register.wal");
    let engine = Arc::new(Engine::new(path).unwrap());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register_space("Main Hall".into(), 50).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::DuplicateName(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.list_spaces().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_space_races_with_creates() {
    let path = test_wal_path("delete_race.wal");
    let engine = Arc::new(Engine::new(path).unwrap());
    let sid = engine.register_space("Room A".into(), 1).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let start = at(i * 2, 0);
            eng.create_reservation(sid, window(start, start + H)).await
        }));
    }
    engine.delete_space(sid).await.unwrap();
    for h in handles {
        match h.await.unwrap() {
            Ok(_) | Err(EngineError::SpaceNotFound(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    // Whatever landed before the delete went with it.
    assert!(engine.list_reservations().await.is_empty());
    assert!(engine.reservation_to_space.is_empty());
}

// ── WAL replay ───────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_state.wal");
    let (a, b, kept, moved);
    {
        let engine = Engine::new(path.clone()).unwrap();
        a = engine.register_space("Room A".into(), 10).await.unwrap();
        b = engine.register_space("Room B".into(), 4).await.unwrap();
        let gone = engine.register_space("Closet".into(), 1).await.unwrap();
        engine.update_space(a, Some("Atrium".into()), Some(20)).await.unwrap();

        kept = engine.create_reservation(a, window(at(9, 0), at(10, 0))).await.unwrap();
        moved = engine.create_reservation(b, window(at(9, 0), at(10, 0))).await.unwrap();
        let cancelled = engine.create_reservation(b, window(at(14, 0), at(15, 0))).await.unwrap();
        engine.create_reservation(gone, window(at(9, 0), at(10, 0))).await.unwrap();

        engine.update_reservation_time(moved, window(at(11, 0), at(13, 0))).await.unwrap();
        engine.cancel_reservation(cancelled).await.unwrap();
        engine.delete_space(gone).await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let spaces = engine.list_spaces().await;
    assert_eq!(
        spaces,
        vec![
            SpaceInfo { id: a, name: "Atrium".into(), capacity: 20 },
            SpaceInfo { id: b, name: "Room B".into(), capacity: 4 },
        ]
    );

    let reservations = engine.list_reservations().await;
    assert_eq!(
        reservations,
        vec![
            ReservationInfo { id: kept, space_id: a, start: at(9, 0), end: at(10, 0) },
            ReservationInfo { id: moved, space_id: b, start: at(11, 0), end: at(13, 0) },
        ]
    );

    // Indexes were rebuilt: names and the overlap rule both hold after replay.
    assert!(matches!(
        engine.register_space("Atrium".into(), 1).await,
        Err(EngineError::DuplicateName(_))
    ));
    engine.register_space("Room A".into(), 1).await.unwrap();
    assert!(matches!(
        engine.create_reservation(b, window(at(12, 0), at(14, 0))).await,
        Err(EngineError::OverlapConflict { .. })
    ));
}

#[tokio::test]
async fn ids_not_reused_after_restart() {
    let path = test_wal_path("ids_restart.wal");
    let (sid, last);
    {
        let engine = Engine::new(path.clone()).unwrap();
        sid = engine.register_space("Room A".into(), 1).await.unwrap();
        engine.create_reservation(sid, window(at(9, 0), at(10, 0))).await.unwrap();
        last = engine.create_reservation(sid, window(at(11, 0), at(12, 0))).await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let next = engine.create_reservation(sid, window(at(14, 0), at(15, 0))).await.unwrap();
    assert!(next > last);
    let next_space = engine.register_space("Room B".into(), 1).await.unwrap();
    assert!(next_space > sid);
}

#[tokio::test]
async fn writes_after_torn_tail_survive_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_tail_restart.wal");
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.register_space("Room A".into(), 1).await.unwrap();
    }
    {
        // Crash mid-append: a length prefix promising more bytes than follow.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
    }
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.register_space("Room B".into(), 1).await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let names: Vec<String> = engine.list_spaces().await.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["Room A", "Room B"]);
}

// ── WAL compaction tests ─────────────────────────────────────

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_preserves.wal");
    let engine = Engine::new(path.clone()).unwrap();
    let sid = engine.register_space("Room A".into(), 6).await.unwrap();
    for day in 0..10 {
        let id = engine
            .create_reservation(sid, window(at(day * 24 + 9, 0), at(day * 24 + 10, 0)))
            .await
            .unwrap();
        if day % 2 == 1 {
            engine.cancel_reservation(id).await.unwrap();
        }
    }
    let before_size = std::fs::metadata(&path).unwrap().len();
    let before = engine.list_reservations().await;

    engine.compact_wal().await.unwrap();

    let after_size = std::fs::metadata(&path).unwrap().len();
    assert!(after_size < before_size, "{after_size} < {before_size}");
    assert_eq!(engine.list_reservations().await, before);

    // Still writable after the swap.
    engine.create_reservation(sid, window(at(300, 0), at(301, 0))).await.unwrap();
    let replayed = Engine::new(path).unwrap();
    assert_eq!(replayed.list_reservations().await.len(), before.len() + 1);
    assert_eq!(replayed.list_spaces().await, engine.list_spaces().await);
}

#[tokio::test]
async fn compact_wal_keeps_id_sequences() {
    let path = test_wal_path("compact_sequences.wal");
    let (dropped_space, dropped_reservation);
    {
        let engine = Engine::new(path.clone()).unwrap();
        let sid = engine.register_space("Room A".into(), 1).await.unwrap();
        dropped_space = engine.register_space("Room B".into(), 1).await.unwrap();
        engine.create_reservation(sid, window(at(9, 0), at(10, 0))).await.unwrap();
        dropped_reservation = engine.create_reservation(sid, window(at(11, 0), at(12, 0))).await.unwrap();

        // The highest ids vanish from the state before compaction.
        engine.cancel_reservation(dropped_reservation).await.unwrap();
        engine.delete_space(dropped_space).await.unwrap();
        engine.compact_wal().await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let sid = engine.list_spaces().await[0].id;
    let r = engine.create_reservation(sid, window(at(11, 0), at(12, 0))).await.unwrap();
    assert!(r > dropped_reservation);
    let s = engine.register_space("Room C".into(), 1).await.unwrap();
    assert!(s > dropped_space);
}

// ── Group-commit WAL tests ───────────────────────────────────

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register_space(format!("Room {i}"), 1).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_spaces().await.len(), n);

    let engine2 = Engine::new(path).unwrap();
    assert_eq!(engine2.list_spaces().await.len(), n);
}

#[tokio::test]
async fn wal_appends_since_compact_through_channel() {
    let (engine, sid) = engine_with_space("appends_counter.wal").await;
    assert_eq!(engine.wal_appends_since_compact().await, 1);

    engine.create_reservation(sid, window(at(9, 0), at(10, 0))).await.unwrap();
    // Rejections write nothing.
    let _ = engine.create_reservation(sid, window(at(9, 0), at(10, 0))).await;
    let _ = engine.create_reservation(sid, window(at(12, 0), at(12, 30))).await;
    assert_eq!(engine.wal_appends_since_compact().await, 2);
}

#[tokio::test]
async fn compact_resets_append_counter() {
    let (engine, sid) = engine_with_space("compact_counter.wal").await;
    engine.create_reservation(sid, window(at(9, 0), at(10, 0))).await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 2);

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}

// ── Limit tests ──────────────────────────────────────────────

#[tokio::test]
async fn name_too_long() {
    let engine = Engine::new(test_wal_path("name_too_long.wal")).unwrap();
    let err = engine
        .register_space("x".repeat(MAX_NAME_LEN + 1), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn name_at_limit() {
    let engine = Engine::new(test_wal_path("name_at_limit.wal")).unwrap();
    engine.register_space("x".repeat(MAX_NAME_LEN), 1).await.unwrap();
}

#[tokio::test]
async fn rename_too_long() {
    let (engine, sid) = engine_with_space("rename_too_long.wal").await;
    let err = engine
        .update_space(sid, Some("y".repeat(MAX_NAME_LEN + 1)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    assert_eq!(engine.get_space(sid).await.unwrap().name, "Room A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn space_limit_holds_under_concurrent_registration() {
    let mut engine = Engine::new(test_wal_path("space_limit_race.wal")).unwrap();
    engine.max_spaces = 3;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register_space(format!("Room {i}"), 1).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::LimitExceeded(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 3);
    let spaces = engine.list_spaces().await;
    assert_eq!(spaces.len(), 3);

    // Deleting frees a slot; a rejected duplicate does not keep one.
    engine.delete_space(spaces[0].id).await.unwrap();
    assert!(matches!(
        engine.register_space(spaces[1].name.clone(), 1).await,
        Err(EngineError::DuplicateName(_))
    ));
    engine.register_space("Annex".into(), 1).await.unwrap();
    assert!(matches!(
        engine.register_space("Annex 2".into(), 1).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Datastore failure ────────────────────────────────────────

fn is_unavailable<T>(result: Result<T, EngineError>) -> bool {
    matches!(result, Err(EngineError::DatastoreUnavailable(_)))
}

#[tokio::test]
async fn failed_wal_append_changes_nothing() {
    let (mut engine, sid) = engine_with_space("wal_unavailable.wal").await;
    let rid = engine.create_reservation(sid, window(at(9, 0), at(10, 0))).await.unwrap();

    // Swap in a writer channel nobody is listening on.
    let (dead_tx, dead_rx) = tokio::sync::mpsc::channel(1);
    drop(dead_rx);
    let live_tx = std::mem::replace(&mut engine.wal_tx, dead_tx);

    assert!(is_unavailable(engine.register_space("Room B".into(), 2).await));
    assert!(!engine.names.contains_key("Room B"));
    assert_eq!(engine.space_slots.load(Ordering::SeqCst), 1);

    assert!(is_unavailable(
        engine.update_space(sid, Some("Atrium".into()), Some(3)).await
    ));
    assert!(!engine.names.contains_key("Atrium"));
    assert_eq!(engine.names.get("Room A").map(|e| *e.value()), Some(sid));

    assert!(is_unavailable(
        engine.create_reservation(sid, window(at(11, 0), at(12, 0))).await
    ));
    assert!(is_unavailable(
        engine.update_reservation_time(rid, window(at(13, 0), at(14, 0))).await
    ));
    assert!(is_unavailable(engine.cancel_reservation(rid).await));
    assert!(is_unavailable(engine.delete_space(sid).await));

    assert_eq!(
        engine.get_space(sid).await.unwrap(),
        SpaceInfo { id: sid, name: "Room A".into(), capacity: 10 }
    );
    assert_eq!(
        engine.list_reservations().await,
        vec![ReservationInfo { id: rid, space_id: sid, start: at(9, 0), end: at(10, 0) }]
    );

    // Once the writer is back, the names that failed to commit are free.
    engine.wal_tx = live_tx;
    engine.register_space("Room B".into(), 2).await.unwrap();
    engine.update_space(sid, Some("Atrium".into()), None).await.unwrap();
    assert_eq!(engine.get_space(sid).await.unwrap().name, "Atrium");
}
