//! Live position calculator.
//!
//! Maps (playlist, wall-clock instant) onto the program that should be on air
//! and the offset into it.  The day's clock, read in a fixed reference zone,
//! is wrapped modulo the playlist length, so the rotation loops all day and
//! every client with the same playlist lands on the same frame.
//!
//! Everything here is a pure function of its arguments.

use chrono::{DateTime, FixedOffset, TimeZone, Timelike};

use crate::protocol::{ActiveShow, Playlist};

/// Seconds since midnight of `now`, read on the reference zone's clock.
pub fn seconds_since_midnight<Tz: TimeZone>(now: &DateTime<Tz>, zone: &FixedOffset) -> u64 {
    let local = now.with_timezone(zone);
    u64::from(local.hour()) * 3600 + u64::from(local.minute()) * 60 + u64::from(local.second())
}

/// What should be on air at `now`.  `None` when the playlist has nothing
/// schedulable.
pub fn compute_active<Tz: TimeZone>(
    playlist: &Playlist,
    now: &DateTime<Tz>,
    zone: &FixedOffset,
) -> Option<ActiveShow> {
    position_at(playlist, seconds_since_midnight(now, zone))
}

/// Map a raw second count onto the rotation.
pub fn position_at(playlist: &Playlist, clock_secs: u64) -> Option<ActiveShow> {
    let total = playlist.total_duration_secs();
    if playlist.is_empty() || total == 0 {
        return None;
    }

    let elapsed = clock_secs % total;
    let mut start = 0u64;
    for (index, item) in playlist.items.iter().enumerate() {
        let end = start + item.scheduled_secs();
        if elapsed >= start && elapsed < end {
            return Some(ActiveShow {
                item: item.clone(),
                offset_secs: elapsed - start,
                index,
            });
        }
        start = end;
    }

    // Unreachable while the modulus and the walk agree on the total; kept so
    // the function stays total.
    first_from(playlist, 0)
}

/// The slot after `index`, wrapping at the end of the rotation, at offset 0.
/// Unresolved items are skipped since they have no air time.
pub fn next_show(playlist: &Playlist, index: usize) -> Option<ActiveShow> {
    if playlist.is_empty() {
        return None;
    }
    first_from(playlist, (index + 1) % playlist.len())
}

fn first_from(playlist: &Playlist, from: usize) -> Option<ActiveShow> {
    let len = playlist.len();
    (0..len)
        .map(|step| (from + step) % len)
        .find(|&i| playlist.items[i].is_resolved())
        .map(|index| ActiveShow {
            item: playlist.items[index].clone(),
            offset_secs: 0,
            index,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DurationSource, PlaylistItem};
    use chrono::Utc;

    fn item(id: &str, secs: Option<u32>) -> PlaylistItem {
        PlaylistItem {
            id: id.into(),
            name: id.into(),
            source_ref: format!("{id}.mp4"),
            duration_secs: secs,
            duration_source: DurationSource::Declared,
        }
    }

    fn abc() -> Playlist {
        Playlist::new(vec![
            item("A", Some(120)),
            item("B", Some(180)),
            item("C", Some(300)),
        ])
    }

    fn at(playlist: &Playlist, secs: u64) -> (String, u64, usize) {
        let show = position_at(playlist, secs).unwrap();
        (show.item.id, show.offset_secs, show.index)
    }

    #[test]
    fn test_boundaries() {
        let p = abc();
        assert_eq!(at(&p, 0), ("A".into(), 0, 0));
        assert_eq!(at(&p, 119), ("A".into(), 119, 0));
        assert_eq!(at(&p, 120), ("B".into(), 0, 1));
        assert_eq!(at(&p, 300), ("C".into(), 0, 2));
        assert_eq!(at(&p, 599), ("C".into(), 299, 2));
        assert_eq!(at(&p, 600), ("A".into(), 0, 0));
    }

    #[test]
    fn test_empty_and_zero_length_playlists_have_no_show() {
        assert!(position_at(&Playlist::default(), 10).is_none());
        let zero = Playlist::new(vec![item("A", None), item("B", Some(0))]);
        assert!(position_at(&zero, 10).is_none());
        assert!(next_show(&zero, 0).is_none());
    }

    #[test]
    fn test_unresolved_items_get_no_air_time() {
        let p = Playlist::new(vec![item("A", Some(10)), item("X", None), item("B", Some(10))]);
        assert_eq!(at(&p, 9), ("A".into(), 9, 0));
        assert_eq!(at(&p, 10), ("B".into(), 0, 2));
        assert_eq!(next_show(&p, 0).unwrap().index, 2);
    }

    #[test]
    fn test_next_show_wraps() {
        let p = abc();
        assert_eq!(next_show(&p, 0).unwrap().index, 1);
        assert_eq!(next_show(&p, 1).unwrap().index, 2);
        let wrapped = next_show(&p, 2).unwrap();
        assert_eq!(wrapped.index, 0);
        assert_eq!(wrapped.offset_secs, 0);
    }

    #[test]
    fn test_next_show_tolerates_index_past_end() {
        // A refresh can shrink the playlist under a show that is still playing.
        let p = abc();
        assert_eq!(next_show(&p, 7).unwrap().index, 2);
    }

    #[test]
    fn test_clock_read_in_reference_zone() {
        let tehran = FixedOffset::east_opt(3 * 3600 + 1800).unwrap();
        // 20:30:15 UTC is 00:00:15 the next day in +03:30.
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 20, 30, 15).unwrap();
        assert_eq!(seconds_since_midnight(&now, &tehran), 15);

        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(seconds_since_midnight(&now, &utc), 20 * 3600 + 30 * 60 + 15);
    }

    #[test]
    fn test_same_instant_same_answer_from_any_host_zone() {
        let zone = FixedOffset::east_opt(3 * 3600 + 1800).unwrap();
        let utc_now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 17, 42).unwrap();
        let tokyo_now = utc_now.with_timezone(&FixedOffset::east_opt(9 * 3600).unwrap());
        let la_now = utc_now.with_timezone(&FixedOffset::west_opt(7 * 3600).unwrap());

        let p = abc();
        let a = compute_active(&p, &utc_now, &zone);
        assert_eq!(a, compute_active(&p, &tokyo_now, &zone));
        assert_eq!(a, compute_active(&p, &la_now, &zone));
    }
}
