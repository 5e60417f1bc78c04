//! Native helper functions callable from eBPF with `call imm`.

/// Signature of a helper: R1-R5 in, R0 out.
pub type HelperFn = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;

/// Helpers indexed by the immediate of `call`.
#[derive(Clone, Default)]
pub struct HelperTable {
    helpers: Vec<HelperFn>,
}

impl HelperTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a helper and return the index programs call it by.
    pub fn register(&mut self, helper: HelperFn) -> i32 {
        self.helpers.push(helper);
        (self.helpers.len() - 1) as i32
    }

    /// Helper for `call index`, if one is registered.
    pub fn get(&self, index: i32) -> Option<HelperFn> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.helpers.get(i))
            .copied()
    }

    /// Address the emitted code calls for `index`.
    pub fn address(&self, index: i32) -> Option<u64> {
        self.get(index).map(|f| f as usize as u64)
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }
}

impl std::fmt::Debug for HelperTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.helpers.iter().map(|h| *h as usize as *const u8))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn add_all(a: u64, b: u64, c: u64, d: u64, e: u64) -> u64 {
        a + b + c + d + e
    }

    unsafe extern "C" fn zero(_: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
        0
    }

    #[test]
    fn test_register_and_lookup() {
        let mut table = HelperTable::new();
        assert!(table.is_empty());
        assert_eq!(table.register(add_all), 0);
        assert_eq!(table.register(zero), 1);
        assert_eq!(table.len(), 2);

        let helper = table.get(0).unwrap();
        assert_eq!(unsafe { helper(1, 2, 3, 4, 5) }, 15);
        assert_eq!(table.address(1), Some(zero as usize as u64));
    }

    #[test]
    fn test_out_of_range() {
        let mut table = HelperTable::new();
        table.register(zero);
        assert!(table.get(1).is_none());
        assert!(table.get(-1).is_none());
        assert!(table.address(7).is_none());
    }
}
