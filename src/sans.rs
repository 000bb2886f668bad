//! Order-insensitive comparison of Subject Alternative Name sets.
//!
//! Renewal authorization requires the requested SAN sets to equal the SAN
//! sets on the certificate currently being served. Equality is defined over
//! canonical string forms (IPs via their textual representation, URIs via
//! their full serialization), ignoring order.

use std::net::IpAddr;

/// Whether two string sequences contain the same elements, ignoring order.
///
/// Used for both DNS-name and email SANs.
pub fn equal_strings(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// Whether two IP sequences are equal by textual form, ignoring order.
pub fn equal_ip_addresses(a: &[IpAddr], b: &[IpAddr]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut a: Vec<String> = a.iter().map(|ip| ip.to_string()).collect();
    let mut b: Vec<String> = b.iter().map(|ip| ip.to_string()).collect();
    a.sort();
    b.sort();
    a == b
}

/// Whether two URI sequences are equal by full serialization, ignoring order.
pub fn equal_uris(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    equal_strings(a, b)
}
