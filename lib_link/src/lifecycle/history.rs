//! Navigation history: a list of `{path}` entries and a cursor, with the
//! push / replace / back / forward behaviour of a browser session history.

use serde::{Deserialize, Serialize};

use crate::lifecycle::page::Route;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryState {
    pub path: String,
}

impl HistoryState {
    pub fn for_route(route: &Route) -> Self {
        Self { path: route.path() }
    }

    pub fn route(&self) -> Route {
        Route::new(&self.path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NavigationHistory {
    entries: Vec<HistoryState>,
    cursor: usize,
}

impl NavigationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry after the current one, dropping any forward entries.
    pub fn push(&mut self, route: &Route) {
        if !self.entries.is_empty() {
            self.entries.truncate(self.cursor + 1);
        }
        self.entries.push(HistoryState::for_route(route));
        self.cursor = self.entries.len() - 1;
    }

    /// Overwrites the current entry, or records the first one.
    pub fn replace(&mut self, route: &Route) {
        match self.entries.get_mut(self.cursor) {
            Some(entry) => *entry = HistoryState::for_route(route),
            None => {
                self.entries.push(HistoryState::for_route(route));
                self.cursor = 0;
            }
        }
    }

    pub fn current(&self) -> Option<&HistoryState> {
        self.entries.get(self.cursor)
    }

    pub fn back(&mut self) -> Option<HistoryState> {
        if self.cursor == 0 || self.entries.is_empty() {
            return None;
        }
        self.cursor -= 1;
        self.current().cloned()
    }

    pub fn forward(&mut self) -> Option<HistoryState> {
        if self.cursor + 1 >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        self.current().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryState] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(history: &NavigationHistory) -> Vec<&str> {
        history.entries().iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn push_back_forward() {
        let mut history = NavigationHistory::new();
        history.replace(&Route::new("dashboard"));
        history.push(&Route::new("logger"));
        history.push(&Route::new("map"));
        assert_eq!(paths(&history), ["/dashboard", "/logger", "/map"]);

        assert_eq!(history.back().unwrap().path, "/logger");
        assert_eq!(history.back().unwrap().path, "/dashboard");
        assert!(history.back().is_none());
        assert_eq!(history.forward().unwrap().path, "/logger");

        history.push(&Route::new("settings"));
        assert_eq!(paths(&history), ["/dashboard", "/logger", "/settings"]);
        assert!(history.forward().is_none());
    }

    #[test]
    fn replace_overwrites_current_entry() {
        let mut history = NavigationHistory::new();
        history.push(&Route::new("dashboard"));
        history.replace(&Route::new("sensors"));
        assert_eq!(history.len(), 1);
        assert_eq!(history.current().unwrap().route(), Route::new("sensors"));
    }

    #[test]
    fn state_serialises_as_path_object() {
        let state = HistoryState::for_route(&Route::new("logger"));
        assert_eq!(serde_json::to_string(&state).unwrap(), r#"{"path":"/logger"}"#);
    }
}
