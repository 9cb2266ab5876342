//! Linear scan over live-interval hulls.
//!
//! Intervals are sorted by start. Registers free up when an active interval
//! ends before the next one starts; when none is free the interval ending
//! last goes to the stack. Stack slots are handed out by a second scan so
//! that slots of expired intervals are reused.

use super::Location;
use crate::asm::Reg;
use crate::ir::eir::VarId;
use std::collections::BTreeSet;

/// Program points covered by a variable, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub var: VarId,
    pub start: u32,
    pub end: u32,
}

impl Interval {
    pub fn cover(&mut self, point: u32) {
        self.start = self.start.min(point);
        self.end = self.end.max(point);
    }
}

#[derive(Debug, Clone, Copy)]
struct Active {
    end: u32,
    var: VarId,
    reg: Reg,
}

/// Assign registers to `intervals`. Returns the register assignments and the
/// intervals that did not get one.
pub fn scan_registers(mut intervals: Vec<Interval>, registers: &[Reg]) -> (Vec<(VarId, Reg)>, Vec<Interval>) {
    intervals.sort_by_key(|i| (i.start, i.var));
    let mut free: Vec<Reg> = registers.to_vec();
    let mut active: Vec<Active> = Vec::new();
    let mut assigned: Vec<(VarId, Reg)> = Vec::new();
    let mut spilled: Vec<Interval> = Vec::new();
    let mut by_var = std::collections::HashMap::new();

    for interval in intervals {
        by_var.insert(interval.var, interval);
        active.retain(|a| {
            if a.end < interval.start {
                free.push(a.reg);
                false
            } else {
                true
            }
        });
        // Keep allocation deterministic: lowest register in declaration order.
        free.sort_by_key(|r| registers.iter().position(|x| x == r));
        if !free.is_empty() {
            let reg = free.remove(0);
            active.push(Active { end: interval.end, var: interval.var, reg });
            assigned.push((interval.var, reg));
            continue;
        }
        let victim = active.iter().enumerate().max_by_key(|(_, a)| (a.end, a.var)).map(|(i, a)| (i, *a));
        match victim {
            Some((index, a)) if a.end > interval.end => {
                active.remove(index);
                assigned.retain(|&(v, _)| v != a.var);
                spilled.push(by_var[&a.var]);
                active.push(Active { end: interval.end, var: interval.var, reg: a.reg });
                assigned.push((interval.var, a.reg));
            }
            _ => spilled.push(interval),
        }
    }
    (assigned, spilled)
}

/// Assign stack slots, reusing slots whose interval has ended. Returns the
/// locations and the number of slots used.
pub fn scan_stack(mut intervals: Vec<Interval>) -> (Vec<(VarId, Location)>, u32) {
    intervals.sort_by_key(|i| (i.start, i.var));
    let mut free: BTreeSet<u32> = BTreeSet::new();
    let mut active: Vec<(u32, u32)> = Vec::new();
    let mut slots = 0;
    let mut out = Vec::with_capacity(intervals.len());
    for interval in intervals {
        active.retain(|&(end, slot)| {
            if end < interval.start {
                free.insert(slot);
                false
            } else {
                true
            }
        });
        let slot = match free.pop_first() {
            Some(slot) => slot,
            None => {
                slots += 1;
                slots - 1
            }
        };
        active.push((interval.end, slot));
        out.push((interval.var, Location::Stack(slot)));
    }
    (out, slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(var: u32, start: u32, end: u32) -> Interval {
        Interval { var: VarId::new(var), start, end }
    }

    #[test]
    fn test_registers_reused_after_expiry() {
        let regs = [Reg::X9, Reg::X10];
        let (assigned, spilled) = scan_registers(vec![iv(0, 0, 3), iv(1, 1, 5), iv(2, 4, 8)], &regs);
        assert!(spilled.is_empty());
        assert_eq!(assigned, vec![(VarId::new(0), Reg::X9), (VarId::new(1), Reg::X10), (VarId::new(2), Reg::X9)]);
    }

    #[test]
    fn test_spill_furthest_end() {
        let regs = [Reg::X9];
        let (assigned, spilled) = scan_registers(vec![iv(0, 0, 20), iv(1, 1, 5)], &regs);
        assert_eq!(assigned, vec![(VarId::new(1), Reg::X9)]);
        assert_eq!(spilled, vec![iv(0, 0, 20)]);

        let (assigned, spilled) = scan_registers(vec![iv(0, 0, 4), iv(1, 1, 9)], &regs);
        assert_eq!(assigned, vec![(VarId::new(0), Reg::X9)]);
        assert_eq!(spilled, vec![iv(1, 1, 9)]);
    }

    #[test]
    fn test_stack_slots_reused() {
        let (locations, slots) = scan_stack(vec![iv(0, 0, 2), iv(1, 1, 6), iv(2, 3, 4)]);
        assert_eq!(slots, 2);
        assert_eq!(locations[2], (VarId::new(2), Location::Stack(0)));
    }
}
