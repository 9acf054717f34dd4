//! CryptoAPI certificate provider

use std::ffi::{c_void, CString};
use std::iter;
use std::mem;
use std::ptr;
use std::slice;

use windows_sys::Win32::Security::Cryptography::{
    CertCloseStore, CertDuplicateCertificateContext, CertEnumCertificatesInStore,
    CertFreeCertificateContext, CertGetCertificateContextProperty, CertOpenStore,
    CryptSignMessage, CERT_CONTEXT, CRYPT_SIGN_MESSAGE_PARA,
};

use super::store::{CertificateProvider, RawCertificate};
use crate::error::StoreError;

const CERT_STORE_PROV_SYSTEM_W: usize = 10;
const CERT_SYSTEM_STORE_CURRENT_USER: u32 = 0x0001_0000;
const CERT_STORE_READONLY_FLAG: u32 = 0x0000_8000;
const CERT_KEY_SPEC_PROP_ID: u32 = 6;
const X509_ASN_ENCODING: u32 = 0x0000_0001;
const PKCS_7_ASN_ENCODING: u32 = 0x0001_0000;

/// The current user's `MY` store
///
/// The store is opened for each enumeration. Certificate contexts keep the
/// store alive on their own, so closing it right away is safe.
pub struct CryptoApiProvider;

impl CryptoApiProvider {
    pub fn new() -> Self {
        Self
    }

    fn context(cert: RawCertificate) -> *const CERT_CONTEXT {
        cert.0 as *const CERT_CONTEXT
    }

    fn has_private_key(context: *const CERT_CONTEXT) -> bool {
        let mut size = 0u32;
        // SAFETY: a size query with a null buffer on a live context
        unsafe {
            CertGetCertificateContextProperty(
                context,
                CERT_KEY_SPEC_PROP_ID,
                ptr::null_mut(),
                &mut size,
            ) != 0
        }
    }
}

impl CertificateProvider for CryptoApiProvider {
    fn enumerate(&self) -> Result<Vec<RawCertificate>, StoreError> {
        let name: Vec<u16> = "MY".encode_utf16().chain(iter::once(0)).collect();

        // SAFETY: `name` is a NUL terminated UTF-16 string outliving the call
        let store = unsafe {
            CertOpenStore(
                CERT_STORE_PROV_SYSTEM_W as _,
                0,
                0,
                CERT_SYSTEM_STORE_CURRENT_USER | CERT_STORE_READONLY_FLAG,
                name.as_ptr() as *const c_void,
            )
        };
        if store.is_null() {
            return Err(StoreError::last_os_error("CertOpenStore"));
        }

        let mut certificates = Vec::new();
        let mut current: *mut CERT_CONTEXT = ptr::null_mut();
        loop {
            // SAFETY: the previous context is released by the enumeration call
            current = unsafe { CertEnumCertificatesInStore(store, current) };
            if current.is_null() {
                break;
            }
            if !Self::has_private_key(current) {
                continue;
            }
            // SAFETY: `current` is a live context from the enumeration
            let copy = unsafe { CertDuplicateCertificateContext(current) };
            if !copy.is_null() {
                certificates.push(RawCertificate(copy as usize));
            }
        }

        // SAFETY: every context still in use holds its own reference
        unsafe { CertCloseStore(store, 0) };
        Ok(certificates)
    }

    fn encoded(&self, cert: RawCertificate) -> Vec<u8> {
        // SAFETY: the caller owns a reference to this context
        unsafe {
            let context = &*Self::context(cert);
            slice::from_raw_parts(context.pbCertEncoded, context.cbCertEncoded as usize).to_vec()
        }
    }

    fn duplicate(&self, cert: RawCertificate) -> RawCertificate {
        // SAFETY: the caller owns a reference to this context
        let copy = unsafe { CertDuplicateCertificateContext(Self::context(cert)) };
        RawCertificate(copy as usize)
    }

    fn free(&self, cert: RawCertificate) {
        // SAFETY: each reference is freed exactly once by its handle
        unsafe { CertFreeCertificateContext(Self::context(cert)) };
    }

    fn sign(&self, cert: RawCertificate, oid: &str, data: &[u8]) -> Result<Vec<u8>, StoreError> {
        let oid = CString::new(oid)
            .map_err(|_| StoreError::Envelope("algorithm identifier contains NUL".to_string()))?;

        // SAFETY: all-zero is a valid value for this plain C struct
        let mut para: CRYPT_SIGN_MESSAGE_PARA = unsafe { mem::zeroed() };
        para.cbSize = mem::size_of::<CRYPT_SIGN_MESSAGE_PARA>() as u32;
        para.dwMsgEncodingType = X509_ASN_ENCODING | PKCS_7_ASN_ENCODING;
        para.pSigningCert = Self::context(cert) as *mut CERT_CONTEXT;
        para.HashAlgorithm.pszObjId = oid.as_ptr() as *mut u8;

        let buffers = [data.as_ptr()];
        let lengths = [data.len() as u32];

        let mut size = 0u32;
        // SAFETY: size query, the buffers above outlive both calls
        let ok = unsafe {
            CryptSignMessage(
                &para,
                1,
                1,
                buffers.as_ptr(),
                lengths.as_ptr(),
                ptr::null_mut(),
                &mut size,
            )
        };
        if ok == 0 {
            return Err(StoreError::last_os_error("CryptSignMessage"));
        }

        let mut envelope = vec![0u8; size as usize];
        // SAFETY: `envelope` holds `size` writable bytes
        let ok = unsafe {
            CryptSignMessage(
                &para,
                1,
                1,
                buffers.as_ptr(),
                lengths.as_ptr(),
                envelope.as_mut_ptr(),
                &mut size,
            )
        };
        if ok == 0 {
            return Err(StoreError::last_os_error("CryptSignMessage"));
        }
        envelope.truncate(size as usize);
        Ok(envelope)
    }
}
