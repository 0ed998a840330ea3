//! Step-based triggers for training and logging.

/// Fires on the first call and then whenever `every` steps have elapsed
/// since the last firing boundary. An interval of 0 never fires.
#[derive(Clone, Debug)]
pub struct Every {
    every: u64,
    last: Option<u64>,
}

impl Every {
    pub fn new(every: u64) -> Self {
        Self { every, last: None }
    }

    pub fn check(&mut self, step: u64) -> bool {
        if self.every == 0 {
            return false;
        }
        match self.last {
            None => {
                self.last = Some(step);
                true
            }
            Some(last) if step >= last + self.every => {
                self.last = Some(last + self.every);
                true
            }
            Some(_) => false,
        }
    }
}

/// Fires exactly once.
#[derive(Clone, Debug, Default)]
pub struct Once {
    done: bool,
}

impl Once {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self) -> bool {
        !std::mem::replace(&mut self.done, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_fires_on_boundaries() {
        let mut every = Every::new(10);
        assert!(every.check(3));
        assert!(!every.check(12));
        assert!(every.check(13));
        assert!(!every.check(20));
        assert!(every.check(40));
        // catches up one interval at a time
        assert!(every.check(40));
    }

    #[test]
    fn test_every_zero_is_disabled() {
        let mut every = Every::new(0);
        assert!(!every.check(0));
        assert!(!every.check(1000));
    }

    #[test]
    fn test_once() {
        let mut once = Once::new();
        assert!(once.check());
        assert!(!once.check());
    }
}
