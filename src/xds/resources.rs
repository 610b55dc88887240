use crate::xds::Protocol;

macro_rules! xds_types {
    (enum $name:ident { $($variant:ident($short:literal) => $xds_type:literal),* $(,)* }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, enum_map::Enum)]
        pub enum $name {
            $(
                $variant,
            )*
        }

        impl $name {
            pub fn all() -> &'static [$name] {
                &[
                    $(
                        $name::$variant,
                    )*
                ]
            }

            pub fn type_url(&self) -> &'static str {
                match self {
                    $(
                        $name::$variant => concat!("type.googleapis.com/", $xds_type),
                    )*
                }
            }

            /// The discovery service name for this type, e.g. `LDS`.
            pub fn short_name(&self) -> &'static str {
                match self {
                    $(
                        $name::$variant => $short,
                    )*
                }
            }

            pub fn from_type_url(type_url: &str) -> Option<Self> {
                Self::all().iter().find(|t| t.type_url() == type_url).copied()
            }
        }
    };
}

xds_types! {
    enum ResourceType {
        Listener("LDS") => "envoy.config.listener.v3.Listener",
        RouteConfiguration("RDS") => "envoy.config.route.v3.RouteConfiguration",
        ScopedRouteConfiguration("SRDS") => "envoy.config.route.v3.ScopedRouteConfiguration",
        VirtualHost("VHDS") => "envoy.config.route.v3.VirtualHost",
        Cluster("CDS") => "envoy.config.cluster.v3.Cluster",
        ClusterLoadAssignment("EDS") => "envoy.config.endpoint.v3.ClusterLoadAssignment",
        Secret("SDS") => "envoy.extensions.transport_sockets.tls.v3.Secret",
        Runtime("RTDS") => "envoy.service.runtime.v3.Runtime",
    }
}

/// The order resources are pushed in while adding or updating. Anything a
/// resource may reference is sent before the resource that references it.
pub const ADD_ORDER: &[ResourceType] = &[
    ResourceType::Secret,
    ResourceType::Runtime,
    ResourceType::Cluster,
    ResourceType::ClusterLoadAssignment,
    ResourceType::Listener,
    ResourceType::RouteConfiguration,
    ResourceType::ScopedRouteConfiguration,
    ResourceType::VirtualHost,
];

/// The order resources are pushed in while removing.
pub const REMOVE_ORDER: &[ResourceType] = &[
    ResourceType::Listener,
    ResourceType::RouteConfiguration,
    ResourceType::ScopedRouteConfiguration,
    ResourceType::VirtualHost,
    ResourceType::Cluster,
    ResourceType::ClusterLoadAssignment,
    ResourceType::Runtime,
    ResourceType::Secret,
];

impl ResourceType {
    /// Whether a client may subscribe to every resource of this type without
    /// naming them.
    ///
    /// In SOTW, Envoy sends an empty EDS request to ask for every endpoint set
    /// it knows about, so EDS is treated as wildcard-capable there.
    pub fn supports_wildcard(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Sotw => matches!(
                self,
                ResourceType::Listener | ResourceType::Cluster | ResourceType::ClusterLoadAssignment
            ),
            Protocol::Delta => matches!(self, ResourceType::Listener | ResourceType::Cluster),
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}
