pub mod error;
pub mod model;

pub use error::ModelError;
pub use model::{
    Itinerary, ItineraryId, Network, Route, RouteId, Station, StationId, Timetable,
    TimetableEntry, Train, TrainId,
};
