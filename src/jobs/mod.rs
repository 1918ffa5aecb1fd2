// Job-Verwaltung: Anfragen, Abbruch-Registry, Dispatcher und Hintergrund-Task.

pub mod background;
pub mod dispatcher;
pub mod registry;
pub mod request;
