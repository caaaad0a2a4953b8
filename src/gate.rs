//! Per-VM migration eligibility: exclusions, cool-down, off-hours (§4.E).

use crate::models::{LastBalanceMap, OffHoursWindow};
use chrono::{DateTime, Timelike, Utc};

pub struct MigrationGate<'a> {
    pub excluded_vms: &'a [u32],
    pub min_balance_interval: chrono::Duration,
    pub consider_time_of_day: bool,
    pub off_hours: OffHoursWindow,
}

impl<'a> MigrationGate<'a> {
    pub fn may_migrate(&self, vmid: u32, last_balance: &LastBalanceMap, now: DateTime<Utc>) -> bool {
        if self.excluded_vms.contains(&vmid) {
            return false;
        }
        if let Some(last) = last_balance.get(&vmid) {
            if now - *last < self.min_balance_interval {
                return false;
            }
        }
        if self.consider_time_of_day && !self.off_hours.contains_hour(now.hour()) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn off_hours_wraps_midnight() {
        let window = OffHoursWindow { start: 22, end: 6 };
        assert!(window.contains_hour(23));
        assert!(window.contains_hour(3));
        assert!(!window.contains_hour(12));
    }

    #[test]
    fn excluded_vm_never_migrates() {
        let last_balance = LastBalanceMap::new();
        let gate = MigrationGate {
            excluded_vms: &[100],
            min_balance_interval: chrono::Duration::seconds(3600),
            consider_time_of_day: false,
            off_hours: OffHoursWindow::default(),
        };
        assert!(!gate.may_migrate(100, &last_balance, at_hour(23)));
    }

    #[test]
    fn cooldown_blocks_recent_migration() {
        let mut last_balance = LastBalanceMap::new();
        let now = at_hour(23);
        last_balance.insert(100, now - chrono::Duration::seconds(60));
        let gate = MigrationGate {
            excluded_vms: &[],
            min_balance_interval: chrono::Duration::seconds(3600),
            consider_time_of_day: false,
            off_hours: OffHoursWindow::default(),
        };
        assert!(!gate.may_migrate(100, &last_balance, now));
    }

    #[test]
    fn time_of_day_check_can_be_disabled() {
        let last_balance = LastBalanceMap::new();
        let gate = MigrationGate {
            excluded_vms: &[],
            min_balance_interval: chrono::Duration::seconds(3600),
            consider_time_of_day: false,
            off_hours: OffHoursWindow { start: 22, end: 6 },
        };
        assert!(gate.may_migrate(100, &last_balance, at_hour(12)));
    }
}
