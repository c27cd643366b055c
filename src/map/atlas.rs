//! Atlas: owner of the active map's lifecycle.
//!
//! The engine keeps one active map at a time; an active-map reset retires the
//! current map and starts a fresh one in place. Retired maps stay owned by
//! the Atlas so stale ids held elsewhere fail to resolve instead of dangling.

use super::map::Map;

pub struct Atlas {
    maps: Vec<Map>,
    active: usize,
}

impl Atlas {
    pub fn new() -> Self {
        Self {
            maps: vec![Map::new()],
            active: 0,
        }
    }

    pub fn active_map(&self) -> &Map {
        &self.maps[self.active]
    }

    pub fn active_map_mut(&mut self) -> &mut Map {
        &mut self.maps[self.active]
    }

    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    /// Retire the active map and start a new one.
    pub fn create_new_map(&mut self) {
        self.maps.push(Map::new());
        self.active = self.maps.len() - 1;
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_map_switches() {
        let mut atlas = Atlas::new();
        assert_eq!(atlas.num_maps(), 1);
        atlas.active_map_mut().set_imu_initialized();
        assert!(atlas.active_map().is_imu_initialized());

        atlas.create_new_map();
        assert_eq!(atlas.num_maps(), 2);
        assert!(!atlas.active_map().is_imu_initialized());
    }
}
