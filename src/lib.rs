pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub mod crypto {
    pub mod signer;
}

pub mod models {
    pub mod charging;
    pub mod lenient;
    pub mod session;
    pub mod telemetry;
    pub mod vehicle;
}

pub mod validation {
    pub mod auth;
}

pub mod services {
    pub mod vendor;
}

pub mod handlers {
    pub mod auth;
    pub mod proxy;
    pub mod vehicles;
}

pub mod middleware_layer {
    pub mod auth;
    pub mod rate_limit;
}

/// Dashboard-side half: talks to the gateway and keeps the session.
pub mod client {
    pub mod enrichment;
    pub mod error;
    pub mod session;
    pub mod storage;
    pub mod vendor;

    pub use vendor::VendorClient;
}

/// Observable stores kept in step with the vendor.
pub mod sync {
    pub mod charging;
    pub mod coalesce;
    pub mod source;
    pub mod stations;
    pub mod store;
    pub mod telemetry;
}
