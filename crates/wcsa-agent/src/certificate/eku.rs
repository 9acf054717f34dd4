//! Extended key usage policy

use der::asn1::ObjectIdentifier;

use super::oid;

/// Whether a certificate with these extended key usages may authenticate
///
/// `None` means the certificate has no EKU extension, which places no
/// restriction on it. Certificates meant only for servers, BitLocker or EFS
/// are refused; anything marked for client or smart card logon, or for any
/// purpose, is accepted. Usages outside those sets are accepted.
pub fn accepts(usages: Option<&[ObjectIdentifier]>) -> bool {
    let Some(usages) = usages else {
        return true;
    };

    let has = |wanted: &ObjectIdentifier| usages.contains(wanted);

    if has(&oid::EKU_ANY) || has(&oid::EKU_CLIENT_AUTH) || has(&oid::EKU_SMART_CARD_LOGON) {
        return true;
    }
    if has(&oid::EKU_BITLOCKER) || has(&oid::EKU_EFS) || has(&oid::EKU_SERVER_AUTH) {
        return false;
    }
    true
}
