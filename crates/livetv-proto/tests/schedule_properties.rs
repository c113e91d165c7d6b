//! Properties of the live position calculator over whole days of clock time.

use chrono::{Duration, FixedOffset, TimeZone, Utc};
use livetv_proto::protocol::{DurationSource, Playlist, PlaylistItem};
use livetv_proto::schedule::{compute_active, next_show, position_at, seconds_since_midnight};

fn playlist(durations: &[u32]) -> Playlist {
    Playlist::new(
        durations
            .iter()
            .enumerate()
            .map(|(i, &secs)| PlaylistItem {
                id: format!("p{i}"),
                name: format!("Program {i}"),
                source_ref: format!("https://cdn.example/{i}.mp4"),
                duration_secs: Some(secs),
                duration_source: DurationSource::Declared,
            })
            .collect(),
    )
}

fn fixtures() -> Vec<Playlist> {
    vec![
        playlist(&[120, 180, 300]),
        playlist(&[1]),
        playlist(&[86_400]),
        playlist(&[7, 13, 1, 1, 29]),
        // Longer than a day: the tail never airs but the math must hold.
        playlist(&[50_000, 50_000]),
    ]
}

fn starts(p: &Playlist) -> Vec<u64> {
    let mut acc = 0;
    p.items
        .iter()
        .map(|i| {
            let s = acc;
            acc += i.scheduled_secs();
            s
        })
        .collect()
}

#[test]
fn exactly_one_item_contains_elapsed_and_offset_is_in_range() {
    for p in fixtures() {
        let total = p.total_duration_secs();
        let starts = starts(&p);
        for clock in (0..86_400u64).step_by(17).chain([86_399]) {
            let show = position_at(&p, clock).expect("non-empty playlist has a show");
            let elapsed = clock % total;
            let duration = show.item.scheduled_secs();

            assert!(show.offset_secs < duration, "offset {} >= {}", show.offset_secs, duration);
            assert_eq!(starts[show.index] + show.offset_secs, elapsed);

            let containing = starts
                .iter()
                .zip(&p.items)
                .filter(|(s, i)| **s <= elapsed && elapsed < **s + i.scheduled_secs())
                .count();
            assert_eq!(containing, 1);
        }
    }
}

#[test]
fn wraps_every_total_duration() {
    for p in fixtures() {
        let total = p.total_duration_secs();
        for clock in [0u64, 1, 119, 120, 599, 4_321, 86_399] {
            let base = position_at(&p, clock);
            for k in 1..4u64 {
                assert_eq!(base, position_at(&p, clock + k * total));
            }
        }
    }
}

#[test]
fn repeated_calls_are_identical() {
    let p = playlist(&[120, 180, 300]);
    let zone = FixedOffset::east_opt(12_600).unwrap();
    let now = Utc.with_ymd_and_hms(2024, 9, 3, 18, 4, 59).unwrap();
    let first = compute_active(&p, &now, &zone);
    for _ in 0..10 {
        assert_eq!(first, compute_active(&p, &now, &zone));
    }
}

#[test]
fn natural_completion_advances_modulo_length() {
    for p in fixtures() {
        let n = p.len();
        for i in 0..n {
            let next = next_show(&p, i).unwrap();
            assert_eq!(next.index, (i + 1) % n);
            assert_eq!(next.offset_secs, 0);
        }
    }
}

#[test]
fn concrete_cycle_of_three() {
    let p = playlist(&[120, 180, 300]);
    let expect = [
        (0, "p0", 0),
        (119, "p0", 119),
        (120, "p1", 0),
        (300, "p2", 0),
        (599, "p2", 299),
        (600, "p0", 0),
    ];
    for (elapsed, id, offset) in expect {
        let show = position_at(&p, elapsed).unwrap();
        assert_eq!((show.item.id.as_str(), show.offset_secs), (id, offset), "at {elapsed}s");
    }
}

#[test]
fn reference_offset_shifts_schedule_by_exactly_the_offset() {
    let p = playlist(&[120, 180, 300, 3_000, 45]);
    let utc = FixedOffset::east_opt(0).unwrap();
    let tehran = FixedOffset::east_opt(12_600).unwrap();
    let base = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();

    for minutes in (0..24 * 60).step_by(37) {
        let now = base + Duration::minutes(minutes);
        let shifted = now + Duration::seconds(12_600);
        assert_eq!(
            compute_active(&p, &now, &tehran),
            compute_active(&p, &shifted, &utc),
            "at {now}"
        );
        assert_eq!(
            seconds_since_midnight(&now, &tehran),
            seconds_since_midnight(&shifted, &utc)
        );
    }
}
